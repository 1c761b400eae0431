//! Relay engine: the per-cell dispatch state machine
//!
//! Every inbound connection delivers exactly one cell. The engine handles
//! it to completion against the shared [`CircuitTable`] and never keeps
//! per-connection state:
//!
//! - CREATE: unwrap `gX`, run the handshake, store the key, answer CREATED
//!   (an empty CREATED if the Create cannot be decrypted)
//! - RELAY on an inbound id: peel one layer and act on the inner cell
//! - RELAY on an outbound id, CREATED, EXTENDED: wrap one layer with the
//!   upstream key and send it back toward the client
//! - DESTROY: purge the circuit and pass a DESTROY to each downstream hop
//! - EXTEND: run the Create handshake with the next hop on the client's behalf
//!
//! No error is fatal. A cell that cannot be handled is logged and dropped.

use super::table::{CircuitTable, Direction};
use crate::error::{OnionError, Result};
use crate::protocol::crypto::{self, IdentityKeyPair};
use crate::protocol::{
    Cell, CircId, CreateCell, CreatedCell, DataCell, DestroyCell, ExtendCell, ExtendedCell,
    Payload, RelayCell, RelaySecret, Route,
};
use crate::transport::CellTransport;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on the exit hop's wait for a destination reply
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles cells for one relay
pub struct RelayEngine {
    identity: IdentityKeyPair,
    /// This relay's own address, written into forwarded Create cells
    local: Route,
    table: Arc<CircuitTable>,
    transport: Arc<dyn CellTransport>,
    io_timeout: Duration,
}

impl RelayEngine {
    pub fn new(
        identity: IdentityKeyPair,
        local: Route,
        table: Arc<CircuitTable>,
        transport: Arc<dyn CellTransport>,
    ) -> Self {
        Self {
            identity,
            local,
            table,
            transport,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn table(&self) -> &Arc<CircuitTable> {
        &self.table
    }

    pub fn local(&self) -> &Route {
        &self.local
    }

    /// Parse and handle one received line, logging instead of failing
    pub async fn handle_line(&self, line: &str) {
        let cell = match Cell::from_line(line) {
            Ok(cell) => cell,
            Err(e) => {
                log::warn!("Dropping unparseable cell: {}", e);
                return;
            }
        };

        let described = cell.describe();
        log::debug!("[{} Cell Received]", described);
        if let Err(e) = self.handle_cell(cell).await {
            if e.is_unroutable() {
                log::warn!("Dropping {}: {}", described, e);
            } else {
                log::warn!("Failed to handle {}: {} (code {:?})", described, e, e.code());
            }
        }
    }

    /// Dispatch one parsed cell
    pub async fn handle_cell(&self, cell: Cell) -> Result<()> {
        match cell {
            Cell::Create(create) => self.on_create(create).await,
            Cell::Relay(relay) => self.on_relay(relay).await,
            Cell::Created(created) => self.on_created(created).await,
            Cell::Extended(extended) => {
                let out_id = extended.circ_id;
                self.send_backward(out_id, Cell::Extended(extended)).await
            }
            Cell::Destroy(destroy) => {
                self.on_destroy(destroy);
                Ok(())
            }
            Cell::Extend(extend) => {
                let inbound_id = extend.circ_id;
                self.on_extend(inbound_id, extend).await
            }
            Cell::Data(data) => {
                log::warn!(
                    "Dropping DATA for {} received outside any circuit",
                    data.server()
                );
                Ok(())
            }
        }
    }

    async fn send(&self, dest: &Route, cell: &Cell) -> Result<()> {
        let line = cell.to_line()?;
        self.transport.send(dest, &line).await?;
        log::debug!("[{} Cell Sent] to {}", cell.describe(), dest);
        Ok(())
    }

    async fn on_create(&self, create: CreateCell) -> Result<()> {
        let source = create.source();

        let Some(g_x) =
            crypto::decrypt_hybrid(&create.encrypted_sym_key, &create.g_x, &self.identity)
        else {
            log::warn!("CREATE#{} from {} did not decrypt", create.circ_id, source);
            return self.send(&source, &Cell::Created(CreatedCell::failed())).await;
        };

        let reply = match crypto::respond(&g_x) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("CREATE#{} handshake failed: {}", create.circ_id, e);
                return self.send(&source, &Cell::Created(CreatedCell::failed())).await;
            }
        };

        if let Err(e) = self
            .table
            .register_inbound(create.circ_id, reply.shared, source.clone())
        {
            log::warn!("CREATE#{} rejected: {}", create.circ_id, e);
            return self.send(&source, &Cell::Created(CreatedCell::failed())).await;
        }

        log::info!(
            "🔑 Circuit {} established with {} (gY {})",
            create.circ_id,
            source,
            crypto::fingerprint(&reply.g_y)
        );
        let created = CreatedCell {
            circ_id: Some(create.circ_id),
            g_y: reply.g_y.to_vec(),
            k_hash: reply.k_hash.to_vec(),
        };
        self.send(&source, &Cell::Created(created)).await
    }

    async fn on_relay(&self, relay: RelayCell) -> Result<()> {
        match self.table.direction(relay.circ_id) {
            Direction::Forward => self.forward(relay).await,
            Direction::Backward => {
                let out_id = relay.circ_id;
                self.send_backward(out_id, Cell::Relay(relay)).await
            }
            Direction::Unknown => Err(OnionError::UnknownCircuit(relay.circ_id)),
        }
    }

    /// Peel one layer of a cell travelling away from the client
    async fn forward(&self, relay: RelayCell) -> Result<()> {
        let inbound_id = relay.circ_id;
        self.table.set_iv(inbound_id, relay.iv);
        let key = self
            .table
            .key(inbound_id)
            .ok_or(OnionError::UnknownCircuit(inbound_id))?;
        let secret = relay.open(&key)?;
        let dest = secret.destination();

        let child = match secret.child {
            Payload::Cell(child) => child,
            Payload::Opaque(value) => {
                log::debug!("Forwarding opaque payload on circuit {} to {}", inbound_id, dest);
                self.transport.send(&dest, &value.to_string()).await?;
                return Ok(());
            }
        };

        match child {
            Cell::Create(mut create) => {
                let out_id = self.table.mint_outbound(inbound_id, dest.clone());
                log::info!("➡️  Extending circuit {} to {} as {}", inbound_id, dest, out_id);
                create.circ_id = out_id;
                create.src_addr = self.local.addr.clone();
                create.src_port = self.local.port;
                self.send(&dest, &Cell::Create(create)).await
            }
            Cell::Data(data) => self.exit(inbound_id, data).await,
            Cell::Relay(mut inner) => {
                let out_id = self
                    .table
                    .outbound_for(inbound_id)
                    .ok_or(OnionError::UnknownCircuit(inbound_id))?;
                inner.circ_id = out_id;
                self.send(&dest, &Cell::Relay(inner)).await
            }
            Cell::Extend(extend) => self.on_extend(inbound_id, extend).await,
            other => self.send(&dest, &other).await,
        }
    }

    /// Exit hop: deliver the payload and return the single reply line
    async fn exit(&self, inbound_id: CircId, data: DataCell) -> Result<()> {
        let server = data.server();
        let line = data.child.to_string();
        log::info!("🌐 Circuit {} exiting to {}", inbound_id, server);

        let reply = match tokio::time::timeout(self.io_timeout, self.transport.request(&server, &line)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(OnionError::Timeout(format!(
                    "no reply from {} within {:?}",
                    server, self.io_timeout
                )))
            }
        };

        let value = serde_json::from_str(&reply).unwrap_or(serde_json::Value::String(reply));
        let (upstream, cell) = self.wrap_backward(inbound_id, Payload::Opaque(value))?;
        self.send(&upstream, &cell).await
    }

    async fn on_created(&self, created: CreatedCell) -> Result<()> {
        let Some(out_id) = created.circ_id else {
            log::warn!("Dropping failed CREATED: downstream relay rejected the handshake");
            return Ok(());
        };

        let child = if self.table.take_pending_extend(out_id) {
            let inbound_id = self
                .table
                .inbound_for(out_id)
                .ok_or(OnionError::UnknownCircuit(out_id))?;
            Cell::Extended(ExtendedCell {
                circ_id: inbound_id,
                g_y: created.g_y,
                k_hash: created.k_hash,
            })
        } else {
            Cell::Created(created)
        };
        self.send_backward(out_id, child).await
    }

    /// Wrap `child` for the upstream circuit of `out_id` and send it back
    async fn send_backward(&self, out_id: CircId, child: Cell) -> Result<()> {
        let inbound_id = self
            .table
            .inbound_for(out_id)
            .ok_or(OnionError::UnknownCircuit(out_id))?;
        let (upstream, cell) = self.wrap_backward(inbound_id, Payload::Cell(child))?;
        self.send(&upstream, &cell).await
    }

    /// One return-path layer under the key and last IV of `inbound_id`
    fn wrap_backward(&self, inbound_id: CircId, child: Payload) -> Result<(Route, Cell)> {
        let key = self
            .table
            .key(inbound_id)
            .ok_or(OnionError::UnknownCircuit(inbound_id))?;
        let upstream = self
            .table
            .upstream(inbound_id)
            .ok_or(OnionError::UnknownCircuit(inbound_id))?;
        let iv = match self.table.iv(inbound_id) {
            Some(iv) => iv,
            None => {
                // Circuit extended by a top-level EXTEND has not seen a RELAY yet
                let iv = crypto::random_iv();
                self.table.set_iv(inbound_id, iv);
                iv
            }
        };

        let secret = RelaySecret::backward(child);
        let cell = RelayCell::seal(inbound_id, &secret, &key, iv)?;
        Ok((upstream, Cell::Relay(cell)))
    }

    /// Purge `circID` and notify each downstream hop; sends are not awaited
    fn on_destroy(&self, destroy: DestroyCell) {
        let downstream = self.table.destroy(destroy.circ_id);
        log::info!(
            "💥 Circuit {} destroyed ({} downstream)",
            destroy.circ_id,
            downstream.len()
        );

        for (out_id, route) in downstream {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let cell = Cell::Destroy(DestroyCell { circ_id: out_id });
                let sent = match cell.to_line() {
                    Ok(line) => transport.send(&route, &line).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(()) => log::debug!("[DESTROY#{} Cell Sent] to {}", out_id, route),
                    Err(e) => log::warn!("DESTROY#{} to {} failed: {}", out_id, route, e),
                }
            });
        }
    }

    /// Run the Create handshake with `extend`'s target for `inbound_id`
    async fn on_extend(&self, inbound_id: CircId, extend: ExtendCell) -> Result<()> {
        if self.table.direction(inbound_id) != Direction::Forward {
            return Err(OnionError::UnknownCircuit(inbound_id));
        }

        let target = extend.target();
        let out_id = self.table.mint_outbound(inbound_id, target.clone());
        self.table.mark_pending_extend(out_id);
        log::info!("➡️  EXTEND circuit {} to {} as {}", inbound_id, target, out_id);

        let create = CreateCell {
            circ_id: out_id,
            encrypted_sym_key: extend.encrypted_sym_key,
            g_x: extend.g_x,
            src_addr: self.local.addr.clone(),
            src_port: self.local.port,
        };
        self.send(&target, &Cell::Create(create)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Circuit, CircuitBuilder, Router, SymmetricKey};
    use crate::relay::table::TableSizes;
    use crate::transport::RecordingTransport;
    use serde_json::json;

    const CLIENT: u16 = 6000;

    fn route(port: u16) -> Route {
        Route::new("127.0.0.1", port)
    }

    struct Harness {
        engine: RelayEngine,
        transport: Arc<RecordingTransport>,
        identity: IdentityKeyPair,
    }

    fn harness(port: u16) -> Harness {
        let identity = IdentityKeyPair::generate();
        let transport = Arc::new(RecordingTransport::new());
        let engine = RelayEngine::new(
            identity.clone(),
            route(port),
            Arc::new(CircuitTable::new()),
            transport.clone(),
        )
        .with_io_timeout(Duration::from_secs(2));
        Harness {
            engine,
            transport,
            identity,
        }
    }

    fn router_for(h: &Harness) -> Router {
        Router::new(h.engine.local().addr.clone(), h.engine.local().port, h.identity.public_b64())
    }

    /// Client circuit with hop 0 established against `h`
    async fn establish_entry(h: &Harness, extra: Vec<Router>) -> (CircuitBuilder, Circuit) {
        let builder = CircuitBuilder::new(route(CLIENT));
        let mut routers = vec![router_for(h)];
        routers.extend(extra);
        let mut circuit = Circuit::new(CircId::new(41), routers);

        let create = builder.construct_create_cell(&mut circuit, 0).unwrap();
        h.engine.handle_cell(Cell::Create(create)).await.unwrap();

        let (to, created) = h.transport.take_sent().pop().unwrap();
        assert_eq!(to, route(CLIENT));
        match Cell::from_line(&created).unwrap() {
            Cell::Created(c) => circuit.complete_hop(0, &c.g_y, &c.k_hash).unwrap(),
            other => panic!("expected CREATED, got {:?}", other),
        }
        (builder, circuit)
    }

    #[tokio::test]
    async fn test_create_registers_and_replies() {
        let h = harness(7001);
        let (_, circuit) = establish_entry(&h, vec![]).await;

        let table = h.engine.table();
        assert_eq!(table.key(circuit.id).as_ref(), circuit.hop_key(0));
        assert_eq!(table.upstream(circuit.id), Some(route(CLIENT)));
        assert_eq!(table.sizes().outbound, 0);
    }

    #[tokio::test]
    async fn test_corrupted_create_gets_empty_created() {
        let h = harness(7001);
        let create = CreateCell {
            circ_id: CircId::new(5),
            encrypted_sym_key: vec![0xde, 0xad, 0xbe, 0xef],
            g_x: vec![1; 32],
            src_addr: "127.0.0.1".into(),
            src_port: CLIENT,
        };
        h.engine.handle_cell(Cell::Create(create)).await.unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(value, json!({"type": "CREATED", "circID": "", "gY": "", "kHash": ""}));
        assert!(h.engine.table().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_create_blob_gets_empty_created() {
        let h = harness(7001);
        let line = format!(
            r#"{{"type":"CREATE","circID":"5","encryptedSymKey":"%%corrupted%%","gX":"AAAA","srcAddr":"127.0.0.1","srcPort":{}}}"#,
            CLIENT
        );
        h.engine.handle_line(&line).await;

        let sent = h.transport.sent_cells();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, route(CLIENT));
        match &sent[0].1 {
            Cell::Created(created) => assert!(created.is_failure()),
            other => panic!("expected CREATED, got {:?}", other),
        }
        assert!(h.engine.table().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_circuit_dropped_without_mutation() {
        let h = harness(7001);
        let (_, circuit) = establish_entry(&h, vec![]).await;
        let before = h.engine.table().sizes();

        let key = SymmetricKey::generate();
        let secret = RelaySecret::forward(&route(7002), Cell::Destroy(DestroyCell { circ_id: CircId::new(1) }));
        let stray = RelayCell::seal(CircId::new(999), &secret, &key, crypto::random_iv()).unwrap();

        let err = h.engine.handle_cell(Cell::Relay(stray.clone())).await.unwrap_err();
        assert!(err.is_unroutable());
        h.engine.handle_line(&Cell::Relay(stray).to_line().unwrap()).await;

        assert_eq!(h.engine.table().sizes(), before);
        assert!(h.engine.table().iv(CircId::new(999)).is_none());
        assert!(h.transport.sent().is_empty());
        assert!(circuit.is_established());
    }

    #[tokio::test]
    async fn test_forward_relay_extends_with_fresh_id() {
        let h = harness(7001);
        let next = IdentityKeyPair::generate();
        let next_router = Router::new("127.0.0.1", 7002, next.public_b64());
        let (builder, mut circuit) = establish_entry(&h, vec![next_router]).await;

        let create = builder.construct_create_cell(&mut circuit, 1).unwrap();
        let nested = builder.nest_relay_cell(&circuit, 1, create.clone()).unwrap();
        let iv = match &nested {
            Cell::Relay(r) => r.iv,
            other => panic!("expected RELAY, got {:?}", other),
        };
        h.engine.handle_cell(nested).await.unwrap();

        // The IV was recorded and the inner Create went to hop 1 rewritten
        let table = h.engine.table();
        assert_eq!(table.iv(circuit.id), Some(iv));
        let (to, line) = h.transport.take_sent().pop().unwrap();
        assert_eq!(to, route(7002));
        let forwarded = match Cell::from_line(&line).unwrap() {
            Cell::Create(c) => c,
            other => panic!("expected CREATE, got {:?}", other),
        };
        assert_ne!(forwarded.circ_id, circuit.id);
        assert_eq!(forwarded.source(), route(7001));
        assert_eq!(forwarded.g_x, create.g_x);

        assert_eq!(table.direction(forwarded.circ_id), Direction::Backward);
        assert_eq!(table.inbound_for(forwarded.circ_id), Some(circuit.id));
        assert_eq!(table.downstream(forwarded.circ_id), Some(route(7002)));
    }

    #[tokio::test]
    async fn test_backward_created_is_wrapped_for_client() {
        let h = harness(7001);
        let next = IdentityKeyPair::generate();
        let next_router = Router::new("127.0.0.1", 7002, next.public_b64());
        let (builder, mut circuit) = establish_entry(&h, vec![next_router]).await;

        let create = builder.construct_create_cell(&mut circuit, 1).unwrap();
        let nested = builder.nest_relay_cell(&circuit, 1, create).unwrap();
        h.engine.handle_cell(nested).await.unwrap();
        let (_, line) = h.transport.take_sent().pop().unwrap();
        let forwarded = match Cell::from_line(&line).unwrap() {
            Cell::Create(c) => c,
            other => panic!("expected CREATE, got {:?}", other),
        };

        // Hop 1 answers as a relay would
        let g_x = crypto::decrypt_hybrid(&forwarded.encrypted_sym_key, &forwarded.g_x, &next).unwrap();
        let reply = crypto::respond(&g_x).unwrap();
        let created = CreatedCell {
            circ_id: Some(forwarded.circ_id),
            g_y: reply.g_y.to_vec(),
            k_hash: reply.k_hash.to_vec(),
        };
        h.engine.handle_cell(Cell::Created(created.clone())).await.unwrap();

        let (to, line) = h.transport.take_sent().pop().unwrap();
        assert_eq!(to, route(CLIENT));
        let unwrapped = circuit.peel(Cell::from_line(&line).unwrap()).unwrap();
        assert_eq!(unwrapped.layers, 1);
        assert_eq!(unwrapped.payload, Payload::Cell(Cell::Created(created.clone())));

        circuit.complete_hop(1, &created.g_y, &created.k_hash).unwrap();
        assert!(circuit.is_established());
    }

    #[tokio::test]
    async fn test_exit_data_round_trip() {
        let h = harness(7001);
        let (builder, circuit) = establish_entry(&h, vec![]).await;
        let server = route(8080);
        h.transport.push_reply(server.clone(), r#"{"reply":"pong"}"#);

        let data = DataCell {
            server_addr: server.addr.clone(),
            server_port: server.port,
            child: json!({"msg": "ping"}),
        };
        let wrapped = builder.wrap_data(&circuit, data).unwrap();
        h.engine.handle_cell(wrapped).await.unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (server, r#"{"msg":"ping"}"#.to_string()));
        assert_eq!(sent[1].0, route(CLIENT));

        let unwrapped = circuit.peel(Cell::from_line(&sent[1].1).unwrap()).unwrap();
        assert_eq!(unwrapped.layers, 1);
        assert_eq!(unwrapped.payload, Payload::Opaque(json!({"reply": "pong"})));
    }

    #[tokio::test]
    async fn test_exit_without_reply_sends_nothing_back() {
        let h = harness(7001);
        let (builder, circuit) = establish_entry(&h, vec![]).await;
        let data = DataCell {
            server_addr: "127.0.0.1".into(),
            server_port: 8081,
            child: json!({"msg": "ping"}),
        };
        let wrapped = builder.wrap_data(&circuit, data).unwrap();
        assert!(h.engine.handle_cell(wrapped).await.is_err());
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_cascades_once() {
        let h = harness(7001);
        let table = h.engine.table();
        let a = CircId::new(100);
        let unrelated = CircId::new(200);
        table.register_inbound(a, SymmetricKey::generate(), route(CLIENT)).unwrap();
        table.register_inbound(unrelated, SymmetricKey::generate(), route(CLIENT)).unwrap();
        let a_out = table.mint_outbound(a, route(7002));
        let unrelated_out = table.mint_outbound(unrelated, route(7003));

        h.engine
            .handle_cell(Cell::Destroy(DestroyCell { circ_id: a }))
            .await
            .unwrap();

        let sent = h.transport.wait_for_sent(1, Duration::from_secs(2)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, route(7002));
        assert_eq!(
            Cell::from_line(&sent[0].1).unwrap(),
            Cell::Destroy(DestroyCell { circ_id: a_out })
        );

        assert_eq!(table.direction(a), Direction::Unknown);
        assert_eq!(table.direction(a_out), Direction::Unknown);
        assert_eq!(table.inbound_for(unrelated_out), Some(unrelated));
        assert_eq!(
            table.sizes(),
            TableSizes {
                keys: 1,
                ivs: 0,
                inbound: 1,
                outbound: 1,
                ask: 1
            }
        );
    }

    #[tokio::test]
    async fn test_extend_then_created_becomes_extended() {
        let h = harness(7001);
        let next = IdentityKeyPair::generate();
        let next_router = Router::new("127.0.0.1", 7002, next.public_b64());
        let (builder, mut circuit) = establish_entry(&h, vec![next_router]).await;

        let extend = builder.construct_extend_cell(&mut circuit, 1).unwrap();
        h.engine.handle_cell(extend).await.unwrap();
        let (to, line) = h.transport.take_sent().pop().unwrap();
        assert_eq!(to, route(7002));
        let create = match Cell::from_line(&line).unwrap() {
            Cell::Create(c) => c,
            other => panic!("expected CREATE, got {:?}", other),
        };
        assert_eq!(create.source(), route(7001));

        let g_x = crypto::decrypt_hybrid(&create.encrypted_sym_key, &create.g_x, &next).unwrap();
        let reply = crypto::respond(&g_x).unwrap();
        let created = CreatedCell {
            circ_id: Some(create.circ_id),
            g_y: reply.g_y.to_vec(),
            k_hash: reply.k_hash.to_vec(),
        };
        h.engine.handle_cell(Cell::Created(created)).await.unwrap();

        let (_, line) = h.transport.take_sent().pop().unwrap();
        let unwrapped = circuit.peel(Cell::from_line(&line).unwrap()).unwrap();
        match unwrapped.payload {
            Payload::Cell(Cell::Extended(extended)) => {
                assert_eq!(extended.circ_id, circuit.id);
                circuit
                    .complete_hop(1, &extended.g_y, &extended.k_hash)
                    .unwrap();
            }
            other => panic!("expected EXTENDED, got {:?}", other),
        }
        assert!(circuit.is_established());
        assert!(!h.engine.table().take_pending_extend(create.circ_id));
    }

    #[tokio::test]
    async fn test_garbage_lines_are_dropped() {
        let h = harness(7001);
        h.engine.handle_line("").await;
        h.engine.handle_line("{oops").await;
        h.engine.handle_line(r#"{"circID":"1"}"#).await;
        h.engine.handle_line(r#"{"type":"PADDING"}"#).await;
        h.engine
            .handle_line(r#"{"type":"DATA","serverAddr":"127.0.0.1","serverPort":1,"child":{}}"#)
            .await;
        assert!(h.transport.sent().is_empty());
        assert!(h.engine.table().is_empty());
    }
}
