//! Stream supervisor
//!
//! Runs one stream command, reads its stdout line by line and hands every
//! match to the tracker. A stream that ends on its own is not restarted.

use reaction_schema::Stream;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::matcher::match_line;
use crate::time::TimeManager;
use crate::tracker::TrackerHandle;
use crate::ActorError;

/// How a stream stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamExit {
    /// Output ended while the daemon was running
    Ended,
    /// Stopped on request
    Stopped,
    /// Could not be started or read
    Failed(String),
}

pub struct StreamSupervisor {
    stream: Arc<Stream>,
    tracker: TrackerHandle,
    clock: TimeManager,
}

impl StreamSupervisor {
    pub fn new(stream: Arc<Stream>, tracker: TrackerHandle, clock: TimeManager) -> Self {
        Self {
            stream,
            tracker,
            clock,
        }
    }

    /// Run the stream until its output ends or `stop` turns true
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> StreamExit {
        let name = self.stream.name.as_str();
        let Some((program, args)) = self.stream.cmd.split_first() else {
            return StreamExit::Failed("empty command".into());
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(stream = name, program, error = %e, "Could not start stream");
                return StreamExit::Failed(format!("{program}: {e}"));
            }
        };
        let Some(stdout) = child.stdout.take() else {
            return StreamExit::Failed("stdout not captured".into());
        };
        info!(stream = name, pid = child.id(), "Stream started");

        let mut lines = BufReader::new(stdout).lines();
        let exit = loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break StreamExit::Stopped;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = self.handle_line(&line).await {
                            warn!(stream = name, error = %e, "Stream stopped feeding the tracker");
                            break StreamExit::Stopped;
                        }
                    }
                    Ok(None) => break StreamExit::Ended,
                    Err(e) => {
                        error!(stream = name, error = %e, "Could not read stream");
                        break StreamExit::Failed(e.to_string());
                    }
                },
            }
        };

        if exit == StreamExit::Stopped {
            if let Err(e) = child.start_kill() {
                debug!(stream = name, error = %e, "Stream already gone");
            }
        }
        match child.wait().await {
            Ok(status) => debug!(stream = name, %status, "Stream command exited"),
            Err(e) => warn!(stream = name, error = %e, "Could not reap stream command"),
        }
        match &exit {
            StreamExit::Ended => error!(stream = name, "Stream ended"),
            StreamExit::Stopped => info!(stream = name, "Stream stopped"),
            StreamExit::Failed(_) => {}
        }
        exit
    }

    /// Observe every filter of the stream matching `line`; returns how many did
    pub async fn handle_line(&self, line: &str) -> Result<usize, ActorError> {
        let ts = self.clock.now_ns();
        let mut matched = 0;
        for filter in &self.stream.filters {
            if let Some(m) = match_line(filter, line) {
                debug!(filter = %filter, m = %m, "Line matched");
                self.tracker.observe(m, filter.clone(), ts).await?;
                matched += 1;
            }
        }
        Ok(matched)
    }
}
