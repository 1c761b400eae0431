//! TCP transport: a fresh connection per cell

use super::{read_line, CellTransport};
use crate::error::{OnionError, Result};
use crate::protocol::Route;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Opens a new TCP connection for every message
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, dest: &Route) -> Result<TcpStream> {
        match timeout(
            self.connect_timeout,
            TcpStream::connect((dest.addr.as_str(), dest.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(OnionError::ConnectionFailed {
                addr: dest.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(OnionError::Timeout(format!("connecting to {}", dest))),
        }
    }

    async fn write_line(stream: &mut TcpStream, line: &str) -> Result<()> {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl CellTransport for TcpTransport {
    async fn send(&self, dest: &Route, line: &str) -> Result<()> {
        let mut stream = self.connect(dest).await?;
        Self::write_line(&mut stream, line).await?;
        stream.shutdown().await?;
        log::trace!("Sent {} bytes to {}", line.len() + 1, dest);
        Ok(())
    }

    async fn request(&self, dest: &Route, line: &str) -> Result<String> {
        let mut stream = self.connect(dest).await?;
        Self::write_line(&mut stream, line).await?;

        let (reader, _writer) = stream.split();
        read_line(reader).await?.ok_or_else(|| {
            OnionError::Io(format!("{} closed the connection without replying", dest))
        })
    }
}
