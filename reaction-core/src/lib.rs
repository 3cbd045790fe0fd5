//! reaction core
//!
//! The concurrent state engine: line matching, the match tracker and action
//! scheduler actors, the persistence log with its replay, the stream
//! supervisor and the client protocol.

pub mod executor;
pub mod matcher;
pub mod persist;
pub mod protocol;
pub mod scheduler;
pub mod supervisor;
pub mod time;
pub mod tracker;

use thiserror::Error;

pub use executor::{run_commands, CommandRunner, ExecError, ProcessRunner, RecordingRunner};
pub use matcher::match_line;
pub use persist::{
    persistence_channel, rotate, FlushEntry, LogRecord, PersistConfig, PersistError,
    PersistHandle, PersistInbox, RecordKind, RotateStats, Rotated,
};
pub use protocol::{match_key, PatternStatus, ProtocolError, Request, Response, StatusTree};
pub use scheduler::{ActionScheduler, PendingAction, SchedulerHandle, FIRE_SLACK};
pub use supervisor::{StreamExit, StreamSupervisor};
pub use time::{MockTimeProvider, RealTimeProvider, TimeManager, TimeProvider, Timestamp};
pub use tracker::{MatchTracker, PendingMatch, TrackerHandle};

/// Capacity of every actor inbox
pub const CHANNEL_SIZE: usize = 1024;

/// Error talking to an actor
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("{0} is not running")]
    Closed(&'static str),
}
