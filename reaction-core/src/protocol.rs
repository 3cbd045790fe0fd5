//! Client protocol
//!
//! One request and one response per connection over the control socket.
//! Each message is a 4-byte big-endian length followed by a JSON payload.

use reaction_schema::{Match, Scope};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::time::Timestamp;

/// Largest accepted message
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message of {0} bytes exceeds the {MAX_FRAME_SIZE} bytes limit")]
    FrameTooLarge(usize),

    #[error("could not connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Current state, optionally restricted
    Show {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<Scope>,
        /// Regex at least one captured value of a shown match must satisfy
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        /// Pattern name to a regex the whole value captured by that pattern
        /// must satisfy; filters lacking one of the patterns show nothing
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        patterns: BTreeMap<String, String>,
    },
    /// Resolve now everything pending for the match `target`
    Flush {
        target: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<Scope>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Status { tree: StatusTree },
    Error { message: String },
}

/// State of one match for one filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStatus {
    /// Observations still inside the retry window
    #[serde(default, skip_serializing_if = "is_zero")]
    pub matches: usize,

    /// Pending fire times per action name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, Vec<Timestamp>>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// stream → filter → match → status
pub type StatusTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, PatternStatus>>>;

/// Key of a match inside its filter's subtree.
///
/// Every match of a filter has one value per pattern of that filter, so a
/// lone value is used as is and longer tuples are written as a JSON array.
pub fn match_key(m: &Match) -> String {
    match m.values() {
        [value] => value.clone(),
        values => serde_json::Value::from(values.to_vec()).to_string(),
    }
}

/// Read one length-prefixed message
pub async fn read_message<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one length-prefixed message
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let data = serde_json::to_vec(message)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Connect to the daemon, send `request` and wait for the answer
pub async fn send_request(socket: &Path, request: &Request) -> Result<Response, ProtocolError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|source| ProtocolError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;
    write_message(&mut stream, request).await?;
    read_message(&mut stream).await
}
