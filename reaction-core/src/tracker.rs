//! Match tracker
//!
//! Single task owning the sliding-window match counts. There is no timer
//! here: expired timestamps are pruned lazily against the timestamp of the
//! next observation.

use ahash::AHashMap;
use reaction_schema::{Filter, Match, Scope};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::persist::{LogRecord, PersistHandle, RecordKind};
use crate::scheduler::SchedulerHandle;
use crate::time::{self, TimeManager, Timestamp};
use crate::{ActorError, CHANNEL_SIZE};

/// Observations between two sweeps of entries nobody observes anymore
const SWEEP_EVERY: u64 = 4096;

/// Timestamps of one match for one filter, still inside the retry window
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub filter: Arc<Filter>,
    pub m: Match,
    pub timestamps: Vec<Timestamp>,
}

enum TrackerMessage {
    Observe {
        m: Match,
        filter: Arc<Filter>,
        ts: Timestamp,
        reply: Option<oneshot::Sender<bool>>,
    },
    Replay {
        kind: RecordKind,
        m: Match,
        filter: Arc<Filter>,
        ts: Timestamp,
        reply: oneshot::Sender<Result<bool, ActorError>>,
    },
    Flush {
        m: Match,
        scope: Option<Scope>,
        reply: oneshot::Sender<Vec<PendingMatch>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PendingMatch>>,
    },
}

/// Handle to the tracker task
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerMessage>,
}

impl TrackerHandle {
    /// Count a live match
    pub async fn observe(&self, m: Match, filter: Arc<Filter>, ts: Timestamp) -> Result<(), ActorError> {
        self.send(TrackerMessage::Observe {
            m,
            filter,
            ts,
            reply: None,
        })
        .await
    }

    /// Count a live match and report whether it triggered
    pub async fn observe_wait(
        &self,
        m: Match,
        filter: Arc<Filter>,
        ts: Timestamp,
    ) -> Result<bool, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMessage::Observe {
            m,
            filter,
            ts,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ActorError::Closed("match tracker"))
    }

    /// Replay a persisted record without writing it again.
    ///
    /// Resolves once the record, and any trigger it causes, is applied.
    /// Returns whether the record ends up as a trigger.
    pub async fn replay(&self, record: &LogRecord, filter: Arc<Filter>) -> Result<bool, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMessage::Replay {
            kind: record.kind,
            m: record.m.clone(),
            filter,
            ts: record.ts,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ActorError::Closed("match tracker"))?
    }

    /// Forget `m`, returning what was pending
    pub async fn flush(&self, m: Match, scope: Option<Scope>) -> Result<Vec<PendingMatch>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMessage::Flush { m, scope, reply }).await?;
        rx.await.map_err(|_| ActorError::Closed("match tracker"))
    }

    pub async fn snapshot(&self) -> Result<Vec<PendingMatch>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| ActorError::Closed("match tracker"))
    }

    async fn send(&self, msg: TrackerMessage) -> Result<(), ActorError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| ActorError::Closed("match tracker"))
    }
}

/// Tracker state, owned by its task
pub struct MatchTracker {
    entries: AHashMap<(Match, Arc<Filter>), Vec<Timestamp>>,
    scheduler: SchedulerHandle,
    persist: Option<PersistHandle>,
    clock: TimeManager,
    observed: u64,
}

impl MatchTracker {
    /// Spawn the tracker task. Without `persist`, nothing is recorded.
    pub fn spawn(
        scheduler: SchedulerHandle,
        persist: Option<PersistHandle>,
        clock: TimeManager,
    ) -> (TrackerHandle, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        let tracker = Self {
            entries: AHashMap::new(),
            scheduler,
            persist,
            clock,
            observed: 0,
        };
        let task = tokio::spawn(tracker.run(receiver));
        (TrackerHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<TrackerMessage>) {
        while let Some(msg) = receiver.recv().await {
            match msg {
                TrackerMessage::Observe { m, filter, ts, reply } => {
                    let triggered = self.live_observe(m, filter, ts).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(triggered);
                    }
                }
                TrackerMessage::Replay {
                    kind,
                    m,
                    filter,
                    ts,
                    reply,
                } => {
                    let result = self.replay(kind, m, filter, ts).await;
                    let _ = reply.send(result);
                }
                TrackerMessage::Flush { m, scope, reply } => {
                    let _ = reply.send(self.flush(&m, scope.as_ref()));
                }
                TrackerMessage::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        debug!(pending = self.entries.len(), "Match tracker stopped");
    }

    /// Window bookkeeping shared by live and replayed observations
    fn observe(&mut self, m: &Match, filter: &Arc<Filter>, ts: Timestamp) -> bool {
        let key = (m.clone(), filter.clone());
        if filter.triggers_at_once() {
            self.entries.remove(&key);
            return true;
        }

        let window = filter.retry_window();
        let timestamps = self.entries.entry(key).or_default();
        timestamps.retain(|&t| time::add(t, window) > ts);
        timestamps.push(ts);

        if timestamps.len() >= filter.retry as usize {
            self.entries.remove(&(m.clone(), filter.clone()));
            return true;
        }
        false
    }

    async fn live_observe(&mut self, m: Match, filter: Arc<Filter>, ts: Timestamp) -> bool {
        let triggered = self.observe(&m, &filter, ts);

        self.observed += 1;
        if self.observed % SWEEP_EVERY == 0 {
            self.prune(self.clock.now_ns());
        }

        let kind = if triggered {
            info!(filter = %filter, m = %m, "Filter triggered");
            if let Err(e) = self.scheduler.trigger(m.clone(), filter.clone(), ts).await {
                warn!(filter = %filter, m = %m, error = %e, "Trigger dropped");
            }
            RecordKind::Triggered
        } else {
            RecordKind::Observed
        };

        if let Some(persist) = &self.persist {
            let record = LogRecord {
                ts,
                kind,
                m,
                stream: filter.stream.clone(),
                filter: filter.name.clone(),
            };
            if let Err(e) = persist.record(record).await {
                warn!(filter = %filter, error = %e, "Record dropped");
            }
        }
        triggered
    }

    async fn replay(
        &mut self,
        kind: RecordKind,
        m: Match,
        filter: Arc<Filter>,
        ts: Timestamp,
    ) -> Result<bool, ActorError> {
        let triggered = match kind {
            RecordKind::Observed => self.observe(&m, &filter, ts),
            RecordKind::Triggered => {
                self.entries.remove(&(m.clone(), filter.clone()));
                true
            }
        };
        if triggered {
            let advance = time::elapsed(ts, self.clock.now_ns());
            self.scheduler.replay_trigger(m, filter, ts, advance).await?;
        }
        Ok(triggered)
    }

    fn flush(&mut self, m: &Match, scope: Option<&Scope>) -> Vec<PendingMatch> {
        let now = self.clock.now_ns();
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(pm, filter)| {
                pm == m && scope.is_none_or(|s| s.contains(&filter.stream, &filter.name))
            })
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let timestamps = self.entries.remove(&key)?;
                let (m, filter) = key;
                let window = filter.retry_window();
                let timestamps: Vec<_> = timestamps
                    .into_iter()
                    .filter(|&t| time::add(t, window) > now)
                    .collect();
                Some(PendingMatch {
                    filter,
                    m,
                    timestamps,
                })
            })
            .collect()
    }

    fn snapshot(&mut self) -> Vec<PendingMatch> {
        self.prune(self.clock.now_ns());
        self.entries
            .iter()
            .map(|((m, filter), timestamps)| PendingMatch {
                filter: filter.clone(),
                m: m.clone(),
                timestamps: timestamps.clone(),
            })
            .collect()
    }

    fn prune(&mut self, now: Timestamp) {
        self.entries.retain(|(_, filter), timestamps| {
            let window = filter.retry_window();
            timestamps.retain(|&t| time::add(t, window) > now);
            !timestamps.is_empty()
        });
    }
}
