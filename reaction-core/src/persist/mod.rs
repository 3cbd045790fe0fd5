//! Persistence
//!
//! Two append-only files live in the state directory: the match log, holding
//! every observation and trigger, and the flush ledger, holding every flush.
//! At startup both are replayed into the actors and compacted; in live mode
//! the persistence task appends to them and compacts again every
//! `rotate_every` records.

pub mod codec;
pub mod log;

mod actor;
mod rotate;

pub use actor::{persistence_channel, PersistHandle, PersistInbox};
pub use rotate::{rotate, FlushLedger, RotateStats, Rotated};

use reaction_schema::{Match, Registry, Scope};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::time::Timestamp;
use crate::ActorError;

/// Match log file name
pub const LOG_FILE: &str = "reaction-matches.db";

/// Flush ledger file name
pub const FLUSH_FILE: &str = "reaction-flushes.db";

/// Suffix of the file a rotation writes before renaming it
pub const ROTATION_SUFFIX: &str = ".new";

/// Persistence errors; all of them are fatal to the daemon
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error accessing {0:?}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("replay interrupted: {0}")]
    Replay(#[from] ActorError),
}

impl PersistError {
    pub(crate) fn io(path: &Path, e: std::io::Error) -> Self {
        Self::Io(path.to_path_buf(), e)
    }
}

/// What happened to a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Counted without reaching the threshold
    Observed,
    /// Reached the threshold and fanned out to the actions
    Triggered,
}

/// One entry of the match log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ts: Timestamp,
    pub kind: RecordKind,
    pub m: Match,
    pub stream: String,
    pub filter: String,
}

/// One entry of the flush ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushEntry {
    pub ts: Timestamp,
    pub m: Match,
    /// `None` for a flush of every stream and filter
    pub scope: Option<Scope>,
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Directory holding the log and the ledger
    pub dir: PathBuf,

    /// Appended records between two live rotations
    pub rotate_every: u64,
}

impl PersistConfig {
    pub fn from_registry(registry: &Registry) -> Self {
        Self {
            dir: registry.state_dir.clone(),
            rotate_every: registry.rotate_every,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(FLUSH_FILE)
    }

    pub fn rotation_path(&self) -> PathBuf {
        self.dir.join(format!("{LOG_FILE}{ROTATION_SUFFIX}"))
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            rotate_every: reaction_schema::DEFAULT_ROTATE_EVERY,
        }
    }
}
