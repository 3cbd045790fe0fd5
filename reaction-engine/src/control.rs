//! Show and flush requests
//!
//! Both read from the two actors and merge their answers into one
//! [`StatusTree`]. A flush also lands in the flush ledger so a restart does
//! not bring the flushed state back.

use reaction_core::{
    match_key, FlushEntry, PendingAction, PendingMatch, PersistHandle, Request, Response,
    SchedulerHandle, StatusTree, TimeManager, TrackerHandle,
};
use reaction_schema::{CaptureSpec, Match, Scope};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::EngineError;

/// Which entries a show request keeps
#[derive(Debug, Default)]
pub struct ShowFilter {
    scope: Option<Scope>,
    any_value: Option<Regex>,
    by_pattern: Vec<(String, Regex)>,
}

impl ShowFilter {
    /// `pattern` must match at least one captured value. Each regex of
    /// `patterns` must match the whole value captured by the pattern it is
    /// keyed by.
    pub fn new(
        scope: Option<Scope>,
        pattern: Option<&str>,
        patterns: &BTreeMap<String, String>,
    ) -> Result<Self, EngineError> {
        let any_value = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| EngineError::Request(format!("invalid pattern: {e}")))?;
        let by_pattern: Vec<(String, Regex)> = patterns
            .iter()
            .map(|(name, regex)| {
                Regex::new(&format!("^(?:{regex})$"))
                    .map(|re| (name.clone(), re))
                    .map_err(|e| EngineError::Request(format!("invalid pattern {name}: {e}")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            scope,
            any_value,
            by_pattern,
        })
    }

    fn keeps(&self, stream: &str, filter: &str, capture: &CaptureSpec, m: &Match) -> bool {
        if self.scope.as_ref().is_some_and(|s| !s.contains(stream, filter)) {
            return false;
        }
        if let Some(re) = &self.any_value {
            if !m.values().iter().any(|v| re.is_match(v)) {
                return false;
            }
        }
        let patterns = capture.patterns();
        self.by_pattern.iter().all(|(name, re)| {
            patterns
                .iter()
                .position(|p| &p.name == name)
                .and_then(|i| m.values().get(i))
                .is_some_and(|v| re.is_match(v))
        })
    }
}

/// Answers client requests from the live actors
#[derive(Clone)]
pub struct Controller {
    tracker: TrackerHandle,
    scheduler: SchedulerHandle,
    persist: Option<PersistHandle>,
    clock: TimeManager,
}

impl Controller {
    pub fn new(
        tracker: TrackerHandle,
        scheduler: SchedulerHandle,
        persist: Option<PersistHandle>,
        clock: TimeManager,
    ) -> Self {
        Self {
            tracker,
            scheduler,
            persist,
            clock,
        }
    }

    /// Serve one request; failures become an error response
    pub async fn handle(&self, request: Request) -> Response {
        debug!(request = ?request, "Client request");
        let result = match request {
            Request::Show {
                scope,
                pattern,
                patterns,
            } => match ShowFilter::new(scope, pattern.as_deref(), &patterns) {
                Ok(filter) => self.show(&filter).await,
                Err(e) => Err(e),
            },
            Request::Flush { target, scope } => self.flush(Match::new(target), scope).await,
        };
        match result {
            Ok(tree) => Response::Status { tree },
            Err(e) => {
                warn!(error = %e, "Client request failed");
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Current state, restricted by `filter`
    pub async fn show(&self, filter: &ShowFilter) -> Result<StatusTree, EngineError> {
        let matches = self.tracker.snapshot().await?;
        let actions = self.scheduler.snapshot().await?;

        let matches = matches
            .into_iter()
            .filter(|p| filter.keeps(&p.filter.stream, &p.filter.name, &p.filter.capture, &p.m));
        let actions = actions
            .into_iter()
            .filter(|p| filter.keeps(&p.action.stream, &p.action.filter, &p.action.capture, &p.m));
        Ok(build_tree(matches, actions))
    }

    /// Resolve now everything pending for `m`, returning what was pending.
    ///
    /// The tracker goes first: a trigger it hands to the scheduler before
    /// handling the flush is then queued ahead of the scheduler's flush.
    pub async fn flush(&self, m: Match, scope: Option<Scope>) -> Result<StatusTree, EngineError> {
        let ts = self.clock.now_ns();
        let matches = self.tracker.flush(m.clone(), scope.clone()).await?;
        let actions = self.scheduler.flush(m.clone(), scope.clone()).await?;

        if let Some(persist) = &self.persist {
            persist
                .flush(FlushEntry {
                    ts,
                    m: m.clone(),
                    scope: scope.clone(),
                })
                .await?;
        }
        info!(
            m = %m,
            scope = ?scope.as_ref().map(ToString::to_string),
            matches = matches.len(),
            actions = actions.len(),
            "Flushed"
        );
        Ok(build_tree(matches, actions))
    }
}

/// Merge tracker and scheduler entries, leaving out empty ones
pub fn build_tree(
    matches: impl IntoIterator<Item = PendingMatch>,
    actions: impl IntoIterator<Item = PendingAction>,
) -> StatusTree {
    let mut tree = StatusTree::new();
    for p in matches {
        if p.timestamps.is_empty() {
            continue;
        }
        tree.entry(p.filter.stream.clone())
            .or_default()
            .entry(p.filter.name.clone())
            .or_default()
            .entry(match_key(&p.m))
            .or_default()
            .matches = p.timestamps.len();
    }
    for p in actions {
        if p.fire_at.is_empty() {
            continue;
        }
        tree.entry(p.action.stream.clone())
            .or_default()
            .entry(p.action.filter.clone())
            .or_default()
            .entry(match_key(&p.m))
            .or_default()
            .actions
            .insert(p.action.name.clone(), p.fire_at);
    }
    tree
}
