//! Command execution
//!
//! Actions, start and stop commands all go through a [`CommandRunner`], so the
//! scheduler never touches the OS directly and tests can record executions.

use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info};

/// Command execution errors
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program:?} exited with {status}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
    },
}

/// Runs one external command to completion
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<(), ExecError>;
}

/// Spawns real processes, optionally bounding how many run at once
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    permits: Option<Arc<Semaphore>>,
}

impl ProcessRunner {
    /// `concurrency == 0` means no limit
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency))),
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<(), ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let _permit = match &self.permits {
            Some(permits) => permits.clone().acquire_owned().await.ok(),
            None => None,
        };

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed {
                program: program.clone(),
                status,
            })
        }
    }
}

/// Records every command instead of running it
#[derive(Debug, Default)]
pub struct RecordingRunner {
    runs: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands run so far, in order
    pub async fn runs(&self) -> Vec<Vec<String>> {
        self.runs.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, argv: &[String]) -> Result<(), ExecError> {
        self.runs.lock().await.push(argv.to_vec());
        Ok(())
    }
}

/// Run a list of commands sequentially; `moment` is `start` or `stop`.
///
/// Returns false if any command failed. Failures do not stop the list.
pub async fn run_commands(runner: &dyn CommandRunner, commands: &[Vec<String>], moment: &str) -> bool {
    let mut ok = true;
    for cmd in commands {
        info!(moment, cmd = ?cmd, "Running command");
        if let Err(e) = runner.run(cmd).await {
            error!(moment, cmd = ?cmd, error = %e, "Command failed");
            ok = false;
        }
    }
    ok
}
