//! Transport layer for cells
//!
//! The protocol core only needs two primitives:
//! - `send`: open a connection, write one line, close
//! - `request`: open a connection, write one line, wait for one reply line
//!
//! Both are behind [`CellTransport`] so the relay engine and the proxy can
//! run against real TCP or against a recording test double.

mod recording;
mod tcp;

pub use recording::RecordingTransport;
pub use tcp::TcpTransport;

use crate::error::{OnionError, Result};
use crate::protocol::Route;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Longest line accepted from a peer (1 MiB)
pub const MAX_LINE_LEN: u64 = 1024 * 1024;

/// Line-oriented, one-message-per-connection transport
#[async_trait]
pub trait CellTransport: Send + Sync {
    /// Deliver one line to `dest` without waiting for an answer
    async fn send(&self, dest: &Route, line: &str) -> Result<()>;

    /// Deliver one line to `dest` and return the single line it answers with
    async fn request(&self, dest: &Route, line: &str) -> Result<String>;
}

/// Read a single newline-terminated line
///
/// Returns `None` when the peer closed the connection without sending
/// anything. The trailing newline is stripped.
pub async fn read_line<R>(reader: R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader.take(MAX_LINE_LEN));
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read as u64 >= MAX_LINE_LEN {
        return Err(OnionError::MalformedCell(format!(
            "line exceeds {} bytes",
            MAX_LINE_LEN
        )));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    Ok(Some(trimmed.to_string()))
}
