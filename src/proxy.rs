//! Onion proxy: the client session
//!
//! Owns one circuit and drives it end to end:
//! 1. `establish`: Create the entry hop directly, then each later hop
//!    through the hops already built
//! 2. `send_data`: wrap a Data cell for the exit and unwrap its reply
//! 3. `destroy`: tell the entry relay to tear the circuit down
//!
//! Relays answer on fresh connections, so the proxy listens on its own
//! `addr:port` and funnels every received line into a channel.

use crate::config::ClientConfig;
use crate::error::{OnionError, Result};
use crate::protocol::{
    Cell, Circuit, CircuitBuilder, DataCell, DestroyCell, Payload, Route, RouterPool,
};
use crate::transport::{read_line, CellTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Buffered reply lines
const REPLY_QUEUE: usize = 64;

/// A client circuit session
pub struct OnionProxy {
    builder: CircuitBuilder,
    circuit: Circuit,
    transport: Arc<dyn CellTransport>,
    replies: mpsc::Receiver<String>,
    listener: JoinHandle<()>,
    reply_timeout: Duration,
}

impl OnionProxy {
    /// Bind the reply listener and pick a `hops`-relay circuit from `pool`
    pub async fn bind(
        config: &ClientConfig,
        pool: &RouterPool,
        hops: usize,
        transport: Arc<dyn CellTransport>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.addr.as_str(), config.port))
            .await
            .map_err(|e| OnionError::ConnectionFailed {
                addr: config.route().to_string(),
                reason: format!("bind failed: {}", e),
            })?;
        let origin = Route::new(config.addr.clone(), listener.local_addr()?.port());

        let builder = CircuitBuilder::new(origin);
        let circuit = builder.build_circuit(pool, hops)?;

        let (tx, rx) = mpsc::channel(REPLY_QUEUE);
        let readers = Arc::new(Semaphore::new(config.max_readers.max(1)));
        let listener = tokio::spawn(listen(listener, tx, readers, config.reply_timeout()));

        Ok(Self {
            builder,
            circuit,
            transport,
            replies: rx,
            listener,
            reply_timeout: config.reply_timeout(),
        })
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// Where relays deliver replies
    pub fn origin(&self) -> &Route {
        self.builder.origin()
    }

    /// Build every hop with nested Create cells
    pub async fn establish(&mut self) -> Result<()> {
        for hop in 0..self.circuit.len() {
            let create = self.builder.construct_create_cell(&mut self.circuit, hop)?;
            let message = self.builder.nest_relay_cell(&self.circuit, hop, create)?;
            self.send_to_entry(&message).await?;
            self.await_handshake(hop).await?;
        }
        log::info!("✅ Circuit {} ready ({} hops)", self.circuit.id, self.circuit.len());
        Ok(())
    }

    /// Build the entry hop directly and every later hop with Extend
    pub async fn establish_with_extend(&mut self) -> Result<()> {
        let create = self.builder.construct_create_cell(&mut self.circuit, 0)?;
        self.send_to_entry(&Cell::Create(create)).await?;
        self.await_handshake(0).await?;

        for hop in 1..self.circuit.len() {
            self.extend_via(hop).await?;
        }
        log::info!("✅ Circuit {} ready ({} hops, extended)", self.circuit.id, self.circuit.len());
        Ok(())
    }

    /// Ask hop `hop - 1` to run the handshake with `hop`
    pub async fn extend_via(&mut self, hop: usize) -> Result<()> {
        let message = self.builder.construct_extend_cell(&mut self.circuit, hop)?;
        self.send_to_entry(&message).await?;
        self.await_handshake(hop).await
    }

    /// Send `payload` to `server` through the exit and return its reply
    pub async fn send_data(&mut self, server: &Route, payload: serde_json::Value) -> Result<serde_json::Value> {
        let data = DataCell {
            server_addr: server.addr.clone(),
            server_port: server.port,
            child: payload,
        };
        let message = self.builder.wrap_data(&self.circuit, data)?;
        self.send_to_entry(&message).await?;
        log::info!("📤 Data for {} sent on circuit {}", server, self.circuit.id);

        let reply = self.next_reply().await?;
        let unwrapped = self.circuit.peel(reply)?;
        if unwrapped.layers != self.circuit.len() {
            log::warn!(
                "Reply came through {} layers, expected {}",
                unwrapped.layers,
                self.circuit.len()
            );
        }
        match unwrapped.payload {
            Payload::Opaque(value) => Ok(value),
            Payload::Cell(cell) => Err(OnionError::UnexpectedCell {
                expected: "opaque reply".into(),
                got: cell.type_name().into(),
            }),
        }
    }

    /// Send Destroy for the circuit and stop listening
    pub async fn destroy(self) -> Result<()> {
        let cell = Cell::Destroy(DestroyCell {
            circ_id: self.circuit.id,
        });
        self.send_to_entry(&cell).await?;
        log::info!("💥 Circuit {} destroyed", self.circuit.id);
        Ok(())
    }

    async fn send_to_entry(&self, cell: &Cell) -> Result<()> {
        let entry = self.circuit.entry()?.route();
        let line = cell.to_line()?;
        self.transport.send(&entry, &line).await?;
        log::debug!("[{} Cell Sent] to {}", cell.describe(), entry);
        Ok(())
    }

    /// Next parseable cell from the reply listener
    async fn next_reply(&mut self) -> Result<Cell> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(OnionError::Internal("reply listener stopped".into())),
                Err(_) => {
                    return Err(OnionError::Timeout(format!(
                        "no reply on circuit {} within {:?}",
                        self.circuit.id, self.reply_timeout
                    )))
                }
            };
            match Cell::from_line(&line) {
                Ok(cell) => {
                    log::debug!("[{} Cell Received]", cell.describe());
                    return Ok(cell);
                }
                Err(e) => log::warn!("Ignoring unparseable reply: {}", e),
            }
        }
    }

    /// Wait for hop `hop`'s Created (or Extended) and verify it
    async fn await_handshake(&mut self, hop: usize) -> Result<()> {
        let reply = self.next_reply().await?;
        let unwrapped = self.circuit.peel(reply)?;
        if unwrapped.layers != hop {
            return Err(OnionError::UnexpectedCell {
                expected: format!("reply wrapped by {} hops", hop),
                got: format!("{} layers", unwrapped.layers),
            });
        }

        match unwrapped.payload {
            Payload::Cell(Cell::Created(created)) => {
                self.circuit.complete_hop(hop, &created.g_y, &created.k_hash)
            }
            Payload::Cell(Cell::Extended(extended)) => {
                self.circuit.complete_hop(hop, &extended.g_y, &extended.k_hash)
            }
            Payload::Cell(other) => Err(OnionError::UnexpectedCell {
                expected: "CREATED".into(),
                got: other.type_name().into(),
            }),
            Payload::Opaque(_) => Err(OnionError::UnexpectedCell {
                expected: "CREATED".into(),
                got: "opaque payload".into(),
            }),
        }
    }
}

impl Drop for OnionProxy {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Accept reply connections and forward each line to the session
///
/// At most `readers` connections are read at once.
async fn listen(
    listener: TcpListener,
    tx: mpsc::Sender<String>,
    readers: Arc<Semaphore>,
    read_timeout: Duration,
) {
    loop {
        let Ok(permit) = Arc::clone(&readers).acquire_owned().await else {
            log::warn!("Reply reader pool closed");
            return;
        };
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Reply accept failed: {}", e);
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(read_timeout, read_line(&mut stream)).await {
                Ok(Ok(Some(line))) => {
                    if tx.send(line).await.is_err() {
                        log::debug!("Session gone, dropping reply from {}", peer);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::warn!("Reply read from {} failed: {}", peer, e),
                Err(_) => log::warn!("Reply read from {} timed out", peer),
            }
            drop(permit);
        });
    }
}
