//! Record framing for the persisted files.
//!
//! Every file starts with a header (magic + version). Every record is:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

/// Current codec version
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying reaction state files
pub const MAGIC: [u8; 4] = *b"RCTN";

/// Records above this size are considered corrupt
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Outcome of reading one record
#[derive(Debug)]
pub enum Decoded<T> {
    Value(T),
    /// Checksum or payload invalid; the next record can still be read
    Corrupt(String),
    /// Framing lost; nothing after this point can be trusted
    Desync(String),
    /// The file ends in the middle of a record
    Truncated,
    /// Clean end of file
    End,
}

/// Serialize a value into one framed record
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Read one framed record.
///
/// Only real I/O failures are returned as errors; damaged data is reported
/// through [`Decoded`].
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<Decoded<T>> {
    let mut version = [0u8; 1];
    loop {
        match reader.read(&mut version) {
            Ok(0) => return Ok(Decoded::End),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if version[0] != CODEC_VERSION {
        return Ok(Decoded::Desync(format!(
            "unsupported record version {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    if !read_full(reader, &mut len_bytes)? {
        return Ok(Decoded::Truncated);
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Ok(Decoded::Desync(format!(
            "record size {len} exceeds maximum {MAX_RECORD_SIZE}"
        )));
    }

    let mut data = vec![0u8; len];
    if !read_full(reader, &mut data)? {
        return Ok(Decoded::Truncated);
    }

    let mut crc_bytes = [0u8; 4];
    if !read_full(reader, &mut crc_bytes)? {
        return Ok(Decoded::Truncated);
    }
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Ok(Decoded::Corrupt(format!(
            "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x}"
        )));
    }

    match serde_json::from_slice(&data) {
        Ok(value) => Ok(Decoded::Value(value)),
        Err(e) => Ok(Decoded::Corrupt(format!("deserialization failed: {e}"))),
    }
}

/// `read_exact`, reporting a premature end of file as `false`
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> IoResult<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write the file header
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header; `None` for an empty file
pub fn read_header(reader: &mut impl Read) -> IoResult<Option<u8>> {
    let mut header = [0u8; 5];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < header.len() || header[..4] != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid header: expected {MAGIC:?}"),
        ));
    }
    Ok(Some(header[4]))
}
