use ahash::AHashMap;
use reaction_schema::{Match, Registry, Scope};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use super::log::{FrameReader, FrameWriter, LogReader, LogWriter};
use super::{FlushEntry, LogRecord, PersistConfig, PersistError, RecordKind};
use crate::time::{self, Timestamp};
use crate::tracker::TrackerHandle;

/// Counters of one rotation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotateStats {
    pub read: usize,
    pub kept: usize,
    /// Dropped because a later flush covers them
    pub flushed: usize,
    /// Dropped because they no longer matter
    pub expired: usize,
    pub malformed: usize,
    /// Dropped records per unknown stream/filter pair
    pub unknown: BTreeMap<(String, String), usize>,
}

/// Writers positioned at the end of the freshly rotated files
pub struct Rotated {
    pub log: LogWriter,
    pub ledger: FrameWriter,
    pub stats: RotateStats,
}

/// Latest flush time per match and scope
#[derive(Debug, Default)]
pub struct FlushLedger {
    entries: AHashMap<Match, Vec<(Option<Scope>, Timestamp)>>,
}

impl FlushLedger {
    /// Read a ledger file, returning it with its count of skipped records
    pub fn load(path: &Path) -> Result<(Self, usize), PersistError> {
        let mut ledger = Self::default();
        let mut reader = FrameReader::<FlushEntry>::open(path)?;
        while let Some(entry) = reader.next()? {
            ledger.insert(entry);
        }
        Ok((ledger, reader.malformed()))
    }

    pub fn insert(&mut self, entry: FlushEntry) {
        let scopes = self.entries.entry(entry.m).or_default();
        match scopes.iter_mut().find(|(scope, _)| *scope == entry.scope) {
            Some((_, ts)) => *ts = (*ts).max(entry.ts),
            None => scopes.push((entry.scope, entry.ts)),
        }
    }

    /// Whether a flush at or after the record covers it
    pub fn suppresses(&self, record: &LogRecord) -> bool {
        let Some(scopes) = self.entries.get(&record.m) else {
            return false;
        };
        scopes.iter().any(|(scope, ts)| {
            *ts >= record.ts
                && scope
                    .as_ref()
                    .is_none_or(|s| s.contains(&record.stream, &record.filter))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compact the match log and reset the flush ledger.
///
/// Records covered by a flush, records of unknown filters and records that no
/// longer matter at `now` are dropped; the rest is rewritten in order. With a
/// tracker, every kept record is also replayed into it, one at a time.
pub async fn rotate(
    registry: &Registry,
    config: &PersistConfig,
    now: Timestamp,
    replay: Option<&TrackerHandle>,
) -> Result<Rotated, PersistError> {
    let log_path = config.log_path();
    let new_path = config.rotation_path();
    let ledger_path = config.ledger_path();

    let (ledger, ledger_malformed) = FlushLedger::load(&ledger_path)?;
    let mut stats = RotateStats {
        malformed: ledger_malformed,
        ..Default::default()
    };

    let mut reader = LogReader::open(&log_path)?;
    let mut writer = LogWriter::create(&new_path)?;

    while let Some(mut record) = reader.next()? {
        stats.read += 1;

        let Some(filter) = registry.filter(&record.stream, &record.filter) else {
            *stats
                .unknown
                .entry((record.stream.clone(), record.filter.clone()))
                .or_default() += 1;
            continue;
        };

        if ledger.suppresses(&record) {
            stats.flushed += 1;
            continue;
        }

        let relevant_for = match record.kind {
            RecordKind::Observed => filter.retry_window(),
            RecordKind::Triggered => filter.longest_delay(),
        };
        if time::add(record.ts, relevant_for) <= now {
            stats.expired += 1;
            continue;
        }

        if let Some(tracker) = replay {
            if tracker.replay(&record, filter.clone()).await? {
                record.kind = RecordKind::Triggered;
            }
        }

        writer.append(&record)?;
        stats.kept += 1;
    }
    stats.malformed += reader.malformed();
    drop(reader);

    writer.sync()?;
    std::fs::rename(&new_path, &log_path).map_err(|e| PersistError::io(&log_path, e))?;
    writer.renamed(&log_path);

    let ledger = FrameWriter::create(&ledger_path)?;

    report(&stats, replay.is_some());
    Ok(Rotated {
        log: writer,
        ledger,
        stats,
    })
}

fn report(stats: &RotateStats, replayed: bool) {
    for ((stream, filter), count) in &stats.unknown {
        warn!(stream, filter, count, "Discarded records of unknown stream/filter");
    }
    if stats.malformed > 0 {
        warn!(count = stats.malformed, "Discarded malformed records");
    }
    info!(
        read = stats.read,
        kept = stats.kept,
        flushed = stats.flushed,
        expired = stats.expired,
        replayed,
        "Match log rotated"
    );
}
