//! Action scheduler
//!
//! Single task owning every pending delayed action. Timers are sleeping tasks
//! that send a `Fire` message back to the scheduler when they expire, so
//! arming, firing and cancelling are all serialized through one inbox. A
//! cancelled timer is aborted and its entry removed; a `Fire` that still
//! arrives finds no entry and does nothing.

use ahash::AHashMap;
use reaction_schema::{Action, Filter, Match, Scope};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::executor::CommandRunner;
use crate::time::{self, TimeManager, Timestamp};
use crate::{ActorError, CHANNEL_SIZE};

/// Actions due within this much time run immediately
pub const FIRE_SLACK: Duration = Duration::from_secs(1);

/// Pending firings of one action for one match
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub action: Arc<Action>,
    pub m: Match,
    /// Scheduled fire times, earliest first
    pub fire_at: Vec<Timestamp>,
}

enum SchedulerMessage {
    Trigger {
        m: Match,
        filter: Arc<Filter>,
        /// Time already counted against the delays; computed on arrival if `None`
        advance: Option<Duration>,
        ts: Timestamp,
        ack: Option<oneshot::Sender<()>>,
    },
    Fire {
        m: Match,
        action: Arc<Action>,
        token: u64,
    },
    Flush {
        m: Match,
        scope: Option<Scope>,
        reply: oneshot::Sender<Vec<PendingAction>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PendingAction>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the scheduler task
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    /// Fan a trigger out to the filter's actions
    pub async fn trigger(&self, m: Match, filter: Arc<Filter>, ts: Timestamp) -> Result<(), ActorError> {
        self.send(SchedulerMessage::Trigger {
            m,
            filter,
            advance: None,
            ts,
            ack: None,
        })
        .await
    }

    /// Replay a persisted trigger; `advance` is the time elapsed since it happened.
    ///
    /// Resolves once the actions are executed or armed.
    pub async fn replay_trigger(
        &self,
        m: Match,
        filter: Arc<Filter>,
        ts: Timestamp,
        advance: Duration,
    ) -> Result<(), ActorError> {
        let (ack, done) = oneshot::channel();
        self.send(SchedulerMessage::Trigger {
            m,
            filter,
            advance: Some(advance),
            ts,
            ack: Some(ack),
        })
        .await?;
        done.await.map_err(|_| ActorError::Closed("action scheduler"))
    }

    /// Execute now every pending action of `m` and forget it
    pub async fn flush(&self, m: Match, scope: Option<Scope>) -> Result<Vec<PendingAction>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Flush { m, scope, reply }).await?;
        rx.await.map_err(|_| ActorError::Closed("action scheduler"))
    }

    pub async fn snapshot(&self) -> Result<Vec<PendingAction>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| ActorError::Closed("action scheduler"))
    }

    /// Run `onexit` actions, drop the others and wait for every execution
    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Shutdown { reply }).await?;
        rx.await.map_err(|_| ActorError::Closed("action scheduler"))
    }

    async fn send(&self, msg: SchedulerMessage) -> Result<(), ActorError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| ActorError::Closed("action scheduler"))
    }
}

struct Pending {
    fire_at: Timestamp,
    timer: AbortHandle,
}

/// Scheduler state, owned by its task
pub struct ActionScheduler {
    pending: AHashMap<(Match, Arc<Action>), BTreeMap<u64, Pending>>,
    next_token: u64,
    executions: JoinSet<()>,
    runner: Arc<dyn CommandRunner>,
    clock: TimeManager,
    inbox: mpsc::WeakSender<SchedulerMessage>,
}

impl ActionScheduler {
    /// Spawn the scheduler task
    pub fn spawn(
        runner: Arc<dyn CommandRunner>,
        clock: TimeManager,
    ) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
        let scheduler = Self {
            pending: AHashMap::new(),
            next_token: 0,
            executions: JoinSet::new(),
            runner,
            clock,
            inbox: sender.downgrade(),
        };
        let task = tokio::spawn(scheduler.run(receiver));
        (SchedulerHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<SchedulerMessage>) {
        loop {
            tokio::select! {
                msg = receiver.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        SchedulerMessage::Trigger { m, filter, advance, ts, ack } => {
                            let replay = advance.is_some();
                            let advance = advance
                                .unwrap_or_else(|| time::elapsed(ts, self.clock.now_ns()));
                            self.schedule(&m, &filter, advance, replay);
                            if let Some(ack) = ack {
                                let _ = ack.send(());
                            }
                        }
                        SchedulerMessage::Fire { m, action, token } => self.fire(m, action, token),
                        SchedulerMessage::Flush { m, scope, reply } => {
                            let _ = reply.send(self.flush(&m, scope.as_ref()));
                        }
                        SchedulerMessage::Snapshot { reply } => {
                            let _ = reply.send(self.snapshot());
                        }
                        SchedulerMessage::Shutdown { reply } => {
                            self.shutdown();
                            self.drain().await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                }
                Some(result) = self.executions.join_next(), if !self.executions.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Action execution task failed");
                    }
                }
            }
        }
        self.drain().await;
        debug!("Action scheduler stopped");
    }

    fn schedule(&mut self, m: &Match, filter: &Arc<Filter>, advance: Duration, replay: bool) {
        let now = self.clock.now_ns();
        for action in &filter.actions {
            let delay = action.delay();
            let remaining = delay.saturating_sub(advance);
            if remaining <= FIRE_SLACK {
                if replay && !delay.is_zero() {
                    info!(
                        action = %action,
                        m = %m,
                        late_by = ?advance.saturating_sub(delay),
                        "Replayed action already due"
                    );
                }
                self.execute(action.clone(), m);
                continue;
            }
            self.arm(m.clone(), action.clone(), remaining, time::add(now, remaining));
        }
    }

    fn arm(&mut self, m: Match, action: Arc<Action>, after: Duration, fire_at: Timestamp) {
        let token = self.next_token;
        self.next_token += 1;

        let inbox = self.inbox.clone();
        let msg = SchedulerMessage::Fire {
            m: m.clone(),
            action: action.clone(),
            token,
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(msg).await;
            }
        });

        debug!(action = %action, m = %m, after = ?after, "Action armed");
        self.pending.entry((m, action)).or_default().insert(
            token,
            Pending {
                fire_at,
                timer: timer.abort_handle(),
            },
        );
    }

    fn fire(&mut self, m: Match, action: Arc<Action>, token: u64) {
        let key = (m, action);
        let Some(timers) = self.pending.get_mut(&key) else {
            return;
        };
        let fired = timers.remove(&token).is_some();
        if timers.is_empty() {
            self.pending.remove(&key);
        }
        if fired {
            let (m, action) = key;
            self.execute(action, &m);
        }
    }

    fn flush(&mut self, m: &Match, scope: Option<&Scope>) -> Vec<PendingAction> {
        let keys: Vec<_> = self
            .pending
            .keys()
            .filter(|(pm, action)| {
                pm == m && scope.is_none_or(|s| s.contains(&action.stream, &action.filter))
            })
            .cloned()
            .collect();

        let mut flushed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(timers) = self.pending.remove(&key) else {
                continue;
            };
            let (m, action) = key;
            let mut fire_at = Vec::with_capacity(timers.len());
            for pending in timers.into_values() {
                pending.timer.abort();
                fire_at.push(pending.fire_at);
                self.execute(action.clone(), &m);
            }
            fire_at.sort_unstable();
            flushed.push(PendingAction { action, m, fire_at });
        }
        flushed
    }

    fn snapshot(&self) -> Vec<PendingAction> {
        self.pending
            .iter()
            .map(|((m, action), timers)| {
                let mut fire_at: Vec<_> = timers.values().map(|p| p.fire_at).collect();
                fire_at.sort_unstable();
                PendingAction {
                    action: action.clone(),
                    m: m.clone(),
                    fire_at,
                }
            })
            .collect()
    }

    fn shutdown(&mut self) {
        let mut discarded = 0usize;
        for ((m, action), timers) in std::mem::take(&mut self.pending) {
            for pending in timers.into_values() {
                pending.timer.abort();
                if action.on_exit {
                    self.execute(action.clone(), &m);
                } else {
                    discarded += 1;
                }
            }
        }
        info!(
            running = self.executions.len(),
            discarded, "Action scheduler shutting down"
        );
    }

    async fn drain(&mut self) {
        while let Some(result) = self.executions.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Action execution task failed");
            }
        }
    }

    fn execute(&mut self, action: Arc<Action>, m: &Match) {
        let argv = action.render(m);
        let runner = self.runner.clone();
        self.executions.spawn(async move {
            info!(action = %action, cmd = ?argv, "Running action");
            if let Err(e) = runner.run(&argv).await {
                error!(action = %action, cmd = ?argv, error = %e, "Action failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingRunner;
    use crate::time::{MockTimeProvider, TimeProvider};
    use reaction_rules::{parse_config, ConfigFormat};
    use reaction_schema::Registry;

    const CONF: &str = r#"
patterns:
  ip: { regex: '[0-9.]+' }
streams:
  ssh:
    cmd: ['true']
    filters:
      failed:
        regex: ['from <ip>']
        actions:
          ban: { cmd: ['ban', '<ip>'] }
          unban: { cmd: ['unban', '<ip>'], after: 5m }
          farewell: { cmd: ['farewell', '<ip>'], after: 1h, onexit: true }
"#;

    fn setup() -> (Registry, Arc<RecordingRunner>, MockTimeProvider, SchedulerHandle) {
        let registry = parse_config(CONF, ConfigFormat::Yaml).unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mock = MockTimeProvider::at(1_000_000_000_000);
        let (handle, _task) =
            ActionScheduler::spawn(runner.clone(), TimeManager::with_mock(mock.clone()));
        (registry, runner, mock, handle)
    }

    fn ip(v: &str) -> Match {
        Match::new(vec![v.to_string()])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn programs(runner: &RecordingRunner) -> Vec<String> {
        settle().await;
        let mut runs: Vec<_> = runner.runs().await.into_iter().map(|r| r.join(" ")).collect();
        runs.sort();
        runs
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_and_delayed() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();

        handle.trigger(ip("1.2.3.4"), filter, mock.now_ns()).await.unwrap();
        let pending = handle.snapshot().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(programs(&runner).await, ["ban 1.2.3.4"]);

        mock.advance(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;
        handle.snapshot().await.unwrap();
        assert_eq!(programs(&runner).await, ["ban 1.2.3.4", "unban 1.2.3.4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_executes_now() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        handle.trigger(ip("1.2.3.4"), filter, mock.now_ns()).await.unwrap();

        mock.advance(Duration::from_secs(60));
        let flushed = handle.flush(ip("1.2.3.4"), None).await.unwrap();
        assert_eq!(flushed.len(), 2);
        handle.shutdown().await.unwrap();

        assert_eq!(
            programs(&runner).await,
            ["ban 1.2.3.4", "farewell 1.2.3.4", "unban 1.2.3.4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_other_match_untouched() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        handle.trigger(ip("1.1.1.1"), filter, mock.now_ns()).await.unwrap();

        assert!(handle.flush(ip("2.2.2.2"), None).await.unwrap().is_empty());
        let scope: Scope = "other".parse().unwrap();
        assert!(handle.flush(ip("1.1.1.1"), Some(scope)).await.unwrap().is_empty());
        assert_eq!(handle.snapshot().await.unwrap().len(), 2);
        assert_eq!(programs(&runner).await, ["ban 1.1.1.1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_runs_only_on_exit() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        handle.trigger(ip("1.2.3.4"), filter, mock.now_ns()).await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(programs(&runner).await, ["ban 1.2.3.4", "farewell 1.2.3.4"]);
        assert!(handle.snapshot().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_trigger_compensates_elapsed_time() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        let now = mock.now_ns();
        let ts = now - Duration::from_secs(180).as_nanos() as u64;

        handle
            .replay_trigger(ip("1.2.3.4"), filter, ts, Duration::from_secs(180))
            .await
            .unwrap();

        let pending = handle.snapshot().await.unwrap();
        let unban = pending.iter().find(|p| p.action.name == "unban").unwrap();
        // fires at ts + 5m, two minutes from now
        assert_eq!(unban.fire_at, [now + Duration::from_secs(120).as_nanos() as u64]);

        tokio::time::sleep(Duration::from_secs(121)).await;
        handle.snapshot().await.unwrap();
        assert_eq!(programs(&runner).await, ["ban 1.2.3.4", "unban 1.2.3.4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_trigger_past_delay_fires_at_once() {
        let (registry, runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        handle
            .replay_trigger(ip("1.2.3.4"), filter, mock.now_ns(), Duration::from_secs(600))
            .await
            .unwrap();

        let pending = handle.snapshot().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action.name, "farewell");
        assert_eq!(programs(&runner).await, ["ban 1.2.3.4", "unban 1.2.3.4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_triggers_keep_separate_timers() {
        let (registry, _runner, mock, handle) = setup();
        let filter = registry.filter("ssh", "failed").unwrap().clone();
        handle.trigger(ip("1.2.3.4"), filter.clone(), mock.now_ns()).await.unwrap();
        mock.advance(Duration::from_secs(10));
        handle.trigger(ip("1.2.3.4"), filter, mock.now_ns()).await.unwrap();

        let pending = handle.snapshot().await.unwrap();
        let unban = pending.iter().find(|p| p.action.name == "unban").unwrap();
        assert_eq!(unban.fire_at.len(), 2);
    }
}
