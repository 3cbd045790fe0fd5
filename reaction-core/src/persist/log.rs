//! Append-only record files.
//!
//! The match log names a stream/filter pair in full the first time it appears
//! in a file and by a small integer alias afterwards. Aliases are local to one
//! file: every rotation starts a new table.

use ahash::AHashMap;
use reaction_schema::Match;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::codec::{self, Decoded};
use super::{LogRecord, PersistError, RecordKind};
use crate::time::Timestamp;

/// Stream/filter reference as written on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Target {
    Named {
        stream: String,
        filter: String,
        alias: u32,
    },
    Alias(u32),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    ts: Timestamp,
    kind: RecordKind,
    m: Match,
    sf: Target,
}

/// Writes framed records to a fresh file
pub struct FrameWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl FrameWriter {
    /// Create or truncate `path` and write the header
    pub fn create(path: &Path) -> Result<Self, PersistError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| PersistError::io(path, e))?;
        let mut out = BufWriter::new(file);
        codec::write_header(&mut out).map_err(|e| PersistError::io(path, e))?;
        out.flush().map_err(|e| PersistError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
        })
    }

    /// Append one record and hand it to the OS
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), PersistError> {
        let bytes = codec::encode(value).map_err(|e| PersistError::io(&self.path, e))?;
        self.out
            .write_all(&bytes)
            .and_then(|_| self.out.flush())
            .map_err(|e| PersistError::io(&self.path, e))
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<(), PersistError> {
        self.out
            .flush()
            .and_then(|_| self.out.get_ref().sync_all())
            .map_err(|e| PersistError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a rename of the underlying file
    pub(crate) fn renamed(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }
}

/// Reads framed records, skipping damaged ones
pub struct FrameReader<T> {
    path: PathBuf,
    input: Option<BufReader<File>>,
    malformed: usize,
    _record: PhantomData<T>,
}

impl<T: DeserializeOwned> FrameReader<T> {
    /// Open `path`; a missing file reads as empty
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        let mut reader = Self {
            path: path.to_path_buf(),
            input: None,
            malformed: 0,
            _record: PhantomData,
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No existing file");
                return Ok(reader);
            }
            Err(e) => return Err(PersistError::io(path, e)),
        };

        let mut input = BufReader::new(file);
        match codec::read_header(&mut input) {
            Ok(Some(_)) => reader.input = Some(input),
            Ok(None) => {}
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                warn!(path = %path.display(), error = %e, "Unreadable file, starting empty");
                reader.malformed += 1;
            }
            Err(e) => return Err(PersistError::io(path, e)),
        }
        Ok(reader)
    }

    /// Next intact record, `None` at the end
    pub fn next(&mut self) -> Result<Option<T>, PersistError> {
        loop {
            let Some(input) = self.input.as_mut() else {
                return Ok(None);
            };
            match codec::decode(input).map_err(|e| PersistError::io(&self.path, e))? {
                Decoded::Value(value) => return Ok(Some(value)),
                Decoded::Corrupt(reason) => {
                    debug!(path = %self.path.display(), reason = %reason, "Skipping malformed record");
                    self.malformed += 1;
                }
                Decoded::Desync(reason) => {
                    debug!(path = %self.path.display(), reason = %reason, "Giving up on the rest of the file");
                    self.malformed += 1;
                    self.input = None;
                }
                Decoded::Truncated => {
                    debug!(path = %self.path.display(), "Ignoring partial trailing record");
                    self.input = None;
                }
                Decoded::End => self.input = None,
            }
        }
    }

    /// Records skipped so far
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

/// Match log writer, owning the alias table of its file
pub struct LogWriter {
    frames: FrameWriter,
    aliases: AHashMap<(String, String), u32>,
}

impl LogWriter {
    pub fn create(path: &Path) -> Result<Self, PersistError> {
        Ok(Self {
            frames: FrameWriter::create(path)?,
            aliases: AHashMap::new(),
        })
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<(), PersistError> {
        let key = (record.stream.clone(), record.filter.clone());
        let sf = match self.aliases.get(&key) {
            Some(&alias) => Target::Alias(alias),
            None => {
                let alias = self.aliases.len() as u32;
                self.aliases.insert(key, alias);
                Target::Named {
                    stream: record.stream.clone(),
                    filter: record.filter.clone(),
                    alias,
                }
            }
        };
        self.frames.write(&WireRecord {
            ts: record.ts,
            kind: record.kind,
            m: record.m.clone(),
            sf,
        })
    }

    pub fn sync(&mut self) -> Result<(), PersistError> {
        self.frames.sync()
    }

    pub fn path(&self) -> &Path {
        self.frames.path()
    }

    pub(crate) fn renamed(&mut self, path: &Path) {
        self.frames.renamed(path);
    }
}

/// Match log reader resolving aliases
pub struct LogReader {
    frames: FrameReader<WireRecord>,
    aliases: AHashMap<u32, (String, String)>,
    unknown_alias: usize,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        Ok(Self {
            frames: FrameReader::open(path)?,
            aliases: AHashMap::new(),
            unknown_alias: 0,
        })
    }

    pub fn next(&mut self) -> Result<Option<LogRecord>, PersistError> {
        while let Some(wire) = self.frames.next()? {
            let (stream, filter) = match wire.sf {
                Target::Named {
                    stream,
                    filter,
                    alias,
                } => {
                    self.aliases.insert(alias, (stream.clone(), filter.clone()));
                    (stream, filter)
                }
                Target::Alias(alias) => match self.aliases.get(&alias) {
                    Some(sf) => sf.clone(),
                    None => {
                        self.unknown_alias += 1;
                        continue;
                    }
                },
            };
            return Ok(Some(LogRecord {
                ts: wire.ts,
                kind: wire.kind,
                m: wire.m,
                stream,
                filter,
            }));
        }
        Ok(None)
    }

    /// Damaged records plus records with an alias never declared
    pub fn malformed(&self) -> usize {
        self.frames.malformed() + self.unknown_alias
    }
}
