//! reaction daemon
//!
//! Wires the core actors together: runs the start commands, replays the
//! persisted state, starts the control socket and one supervisor per stream,
//! then tears everything down in order when asked to or when every stream
//! has ended.

pub mod control;
pub mod server;

use reaction_core::{
    persistence_channel, rotate, run_commands, ActionScheduler, ActorError, CommandRunner,
    MatchTracker, PersistConfig, PersistError, StreamExit, StreamSupervisor, TimeManager,
    CHANNEL_SIZE,
};
use reaction_schema::Registry;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use control::{build_tree, Controller, ShowFilter};
pub use server::ControlServer;

/// Default control socket
pub const DEFAULT_SOCKET: &str = "/run/reaction/reaction.sock";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not create state directory {path:?}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control socket {path:?}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("persistence task stopped: {0}")]
    PersistStopped(String),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("{0}")]
    Request(String),
}

/// Daemon configuration not coming from the configuration file
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
        }
    }
}

/// Why the daemon stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Signal or caller request
    Requested,
    /// Every stream ended on its own
    StreamsEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    pub cause: ShutdownCause,
    /// Whether every stop command succeeded
    pub stop_ok: bool,
}

impl DaemonExit {
    pub fn success(&self) -> bool {
        self.cause == ShutdownCause::Requested && self.stop_ok
    }
}

pub struct Daemon {
    registry: Arc<Registry>,
    config: DaemonConfig,
    runner: Arc<dyn CommandRunner>,
    clock: TimeManager,
}

impl Daemon {
    pub fn new(
        registry: Arc<Registry>,
        config: DaemonConfig,
        runner: Arc<dyn CommandRunner>,
        clock: TimeManager,
    ) -> Self {
        Self {
            registry,
            config,
            runner,
            clock,
        }
    }

    /// Run until `shutdown` resolves or every stream has ended
    pub async fn run<F>(self, shutdown: F) -> Result<DaemonExit, EngineError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            registry,
            config,
            runner,
            clock,
        } = self;

        // start failures are logged, not fatal
        if !run_commands(runner.as_ref(), &registry.start, "start").await {
            error!("Some start commands failed, starting anyway");
        }

        let persist_config = PersistConfig::from_registry(&registry);
        std::fs::create_dir_all(&persist_config.dir).map_err(|source| EngineError::StateDir {
            path: persist_config.dir.clone(),
            source,
        })?;

        let (scheduler, _) = ActionScheduler::spawn(runner.clone(), clock.clone());
        let (persist, inbox) = persistence_channel(CHANNEL_SIZE);
        let (tracker, _) = MatchTracker::spawn(scheduler.clone(), Some(persist.clone()), clock.clone());

        let rotated = match rotate(&registry, &persist_config, clock.now_ns(), Some(&tracker)).await {
            Ok(rotated) => rotated,
            Err(e) => {
                error!(error = %e, "Could not restore state, running stop commands");
                run_commands(runner.as_ref(), &registry.stop, "stop").await;
                return Err(e.into());
            }
        };
        info!(
            kept = rotated.stats.kept,
            dir = %persist_config.dir.display(),
            "State restored"
        );
        let mut persist_task = inbox.spawn(persist_config, registry.clone(), rotated, clock.clone());

        let server = match ControlServer::bind(&config.socket).await {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Could not open control socket, running stop commands");
                if let Err(stop_err) = scheduler.shutdown().await {
                    warn!(error = %stop_err, "Action scheduler already stopped");
                }
                run_commands(runner.as_ref(), &registry.stop, "stop").await;
                if let Err(close_err) = persist.close().await {
                    warn!(error = %close_err, "Persistence already stopped");
                }
                match persist_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(persist_err)) => error!(error = %persist_err, "Persistence failed"),
                    Err(join_err) => error!(error = %join_err, "Persistence task panicked"),
                }
                return Err(e);
            }
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let controller = Controller::new(
            tracker.clone(),
            scheduler.clone(),
            Some(persist.clone()),
            clock.clone(),
        );
        let server_task = tokio::spawn(server.run(controller, stop_rx.clone()));

        let mut streams = JoinSet::new();
        for stream in &registry.streams {
            let supervisor = StreamSupervisor::new(stream.clone(), tracker.clone(), clock.clone());
            streams.spawn(supervisor.run(stop_rx.clone()));
        }
        info!(streams = registry.streams.len(), "Daemon started");

        tokio::pin!(shutdown);
        let mut persist_failure = None;
        let cause = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break ShutdownCause::Requested;
                }
                joined = streams.join_next() => match joined {
                    Some(Ok(exit)) => debug!(exit = ?exit, "Stream supervisor finished"),
                    Some(Err(e)) => error!(error = %e, "Stream supervisor panicked"),
                    None => {
                        error!("All streams ended, shutting down");
                        break ShutdownCause::StreamsEnded;
                    }
                },
                result = &mut persist_task => {
                    let failure = match result {
                        Ok(Err(e)) => EngineError::Persist(e),
                        Ok(Ok(())) => EngineError::PersistStopped("closed unexpectedly".into()),
                        Err(e) => EngineError::PersistStopped(e.to_string()),
                    };
                    error!(error = %failure, "Persistence failed, shutting down");
                    persist_failure = Some(failure);
                    break ShutdownCause::Requested;
                }
            }
        };

        let _ = stop_tx.send(true);
        while let Some(joined) = streams.join_next().await {
            match joined {
                Ok(StreamExit::Failed(reason)) => warn!(reason = %reason, "Stream had failed"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Stream supervisor panicked"),
            }
        }

        // observations already queued still reach the scheduler and the log
        if let Err(e) = tracker.snapshot().await {
            warn!(error = %e, "Match tracker already stopped");
        }
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Action scheduler already stopped");
        }
        let stop_ok = run_commands(runner.as_ref(), &registry.stop, "stop").await;

        if persist_failure.is_none() {
            if let Err(e) = persist.close().await {
                warn!(error = %e, "Persistence already stopped");
            }
            match persist_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => persist_failure = Some(EngineError::Persist(e)),
                Err(e) => persist_failure = Some(EngineError::PersistStopped(e.to_string())),
            }
        }

        if let Err(e) = server_task.await {
            error!(error = %e, "Control socket task panicked");
        }

        match persist_failure {
            Some(e) => Err(e),
            None => {
                info!(cause = ?cause, stop_ok, "Daemon stopped");
                Ok(DaemonExit { cause, stop_ok })
            }
        }
    }
}
