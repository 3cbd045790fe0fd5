use reaction_schema::Registry;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::log::{FrameWriter, LogWriter};
use super::rotate::{rotate, Rotated};
use super::{FlushEntry, LogRecord, PersistConfig, PersistError};
use crate::time::TimeManager;
use crate::ActorError;

enum PersistMessage {
    Record(LogRecord),
    Flush(FlushEntry),
    Close { ack: oneshot::Sender<()> },
}

/// Handle to the persistence task
#[derive(Debug, Clone)]
pub struct PersistHandle {
    sender: mpsc::Sender<PersistMessage>,
}

/// Receiving side, consumed when the task is spawned
pub struct PersistInbox {
    receiver: mpsc::Receiver<PersistMessage>,
}

/// Create the persistence channel.
///
/// The handle exists before the task so the tracker can hold it while the
/// startup replay still runs; nothing is consumed until [`PersistInbox::spawn`].
pub fn persistence_channel(capacity: usize) -> (PersistHandle, PersistInbox) {
    let (sender, receiver) = mpsc::channel(capacity);
    (PersistHandle { sender }, PersistInbox { receiver })
}

impl PersistHandle {
    /// Append a match log record
    pub async fn record(&self, record: LogRecord) -> Result<(), ActorError> {
        self.send(PersistMessage::Record(record)).await
    }

    /// Append a flush ledger entry
    pub async fn flush(&self, entry: FlushEntry) -> Result<(), ActorError> {
        self.send(PersistMessage::Flush(entry)).await
    }

    /// Write out everything queued so far and stop the task
    pub async fn close(&self) -> Result<(), ActorError> {
        let (ack, done) = oneshot::channel();
        self.send(PersistMessage::Close { ack }).await?;
        done.await.map_err(|_| ActorError::Closed("persistence"))
    }

    async fn send(&self, msg: PersistMessage) -> Result<(), ActorError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| ActorError::Closed("persistence"))
    }
}

struct Persistence {
    config: PersistConfig,
    registry: Arc<Registry>,
    clock: TimeManager,
    log: LogWriter,
    ledger: FrameWriter,
    since_rotation: u64,
}

impl PersistInbox {
    /// Start the persistence task on the files of a completed rotation.
    ///
    /// The task ends with an error on the first I/O failure.
    pub fn spawn(
        self,
        config: PersistConfig,
        registry: Arc<Registry>,
        rotated: Rotated,
        clock: TimeManager,
    ) -> JoinHandle<Result<(), PersistError>> {
        let persistence = Persistence {
            config,
            registry,
            clock,
            log: rotated.log,
            ledger: rotated.ledger,
            since_rotation: 0,
        };
        tokio::spawn(persistence.run(self.receiver))
    }
}

impl Persistence {
    async fn run(mut self, mut receiver: mpsc::Receiver<PersistMessage>) -> Result<(), PersistError> {
        while let Some(msg) = receiver.recv().await {
            match msg {
                PersistMessage::Record(record) => {
                    if let Err(e) = self.append(&record).await {
                        error!(error = %e, "Match log write failed");
                        return Err(e);
                    }
                }
                PersistMessage::Flush(entry) => {
                    if let Err(e) = self.ledger.write(&entry) {
                        error!(error = %e, "Flush ledger write failed");
                        return Err(e);
                    }
                }
                PersistMessage::Close { ack } => {
                    receiver.close();
                    let result = self.drain(&mut receiver).await;
                    let _ = ack.send(());
                    return result;
                }
            }
        }
        self.sync()
    }

    async fn append(&mut self, record: &LogRecord) -> Result<(), PersistError> {
        self.log.append(record)?;
        self.since_rotation += 1;
        if self.since_rotation >= self.config.rotate_every {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), PersistError> {
        info!(records = self.since_rotation, "Rotating match log");
        self.sync()?;
        let rotated = rotate(&self.registry, &self.config, self.clock.now_ns(), None).await?;
        self.log = rotated.log;
        self.ledger = rotated.ledger;
        self.since_rotation = 0;
        Ok(())
    }

    /// Write whatever was queued before the close, then sync
    async fn drain(&mut self, receiver: &mut mpsc::Receiver<PersistMessage>) -> Result<(), PersistError> {
        while let Ok(msg) = receiver.try_recv() {
            match msg {
                PersistMessage::Record(record) => self.log.append(&record)?,
                PersistMessage::Flush(entry) => self.ledger.write(&entry)?,
                PersistMessage::Close { ack } => {
                    let _ = ack.send(());
                }
            }
        }
        self.sync()?;
        debug!(path = %self.log.path().display(), "Persistence closed");
        Ok(())
    }

    fn sync(&mut self) -> Result<(), PersistError> {
        self.log.sync()?;
        self.ledger.sync()
    }
}
