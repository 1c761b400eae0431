//! Relay server: accept loop feeding a bounded worker pool
//!
//! Each accepted connection carries one cell. A worker reads the line,
//! closes the socket and hands the cell to the shared [`RelayEngine`].
//! At most `max_workers` connections are handled at once; the accept loop
//! waits for a free permit before taking the next connection.

use super::engine::RelayEngine;
use super::table::CircuitTable;
use crate::config::RouterConfig;
use crate::error::{OnionError, Result};
use crate::protocol::{IdentityKeyPair, Route};
use crate::transport::{read_line, CellTransport};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// A listening relay
pub struct RelayServer {
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    workers: Arc<Semaphore>,
    read_timeout: Duration,
}

impl RelayServer {
    /// Bind the relay described by `config`
    ///
    /// Port 0 binds an ephemeral port; the engine is told the real one so
    /// forwarded Create cells carry a reachable source address.
    pub async fn bind(
        config: &RouterConfig,
        identity: IdentityKeyPair,
        transport: Arc<dyn CellTransport>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.addr.as_str(), config.port))
            .await
            .map_err(|e| OnionError::ConnectionFailed {
                addr: format!("{}:{}", config.addr, config.port),
                reason: format!("bind failed: {}", e),
            })?;
        let local = Route::new(config.addr.clone(), listener.local_addr()?.port());

        let engine = RelayEngine::new(identity, local, Arc::new(CircuitTable::new()), transport)
            .with_io_timeout(config.io_timeout());

        Ok(Self::from_parts(
            listener,
            Arc::new(engine),
            config.max_workers,
            config.io_timeout(),
        ))
    }

    pub fn from_parts(
        listener: TcpListener,
        engine: Arc<RelayEngine>,
        max_workers: usize,
        read_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            engine,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            read_timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Serve until the process stops
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// Workers already running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        log::info!("🧅 Relay listening on {}", self.engine.local());
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.workers).acquire_owned() => permit
                    .map_err(|_| OnionError::Internal("worker pool closed".into()))?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let engine = Arc::clone(&self.engine);
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                serve_connection(engine, stream, peer, read_timeout).await;
                drop(permit);
            });
        }

        log::info!("Relay on {} shutting down", self.engine.local());
        Ok(())
    }
}

/// Read one cell, close the connection, then dispatch
async fn serve_connection(
    engine: Arc<RelayEngine>,
    mut stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
) {
    let line = match tokio::time::timeout(read_timeout, read_line(&mut stream)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            log::debug!("{} closed without sending a cell", peer);
            return;
        }
        Ok(Err(e)) => {
            log::warn!("Read from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            log::warn!("Read from {} timed out", peer);
            return;
        }
    };
    drop(stream);

    engine.handle_line(&line).await;
}
