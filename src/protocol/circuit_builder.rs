//! Circuit builder
//!
//! Client side of circuit construction:
//! 1. Pick `ROUTER_COUNT` distinct relays from the pool
//! 2. Build one hybrid-encrypted Create cell per hop
//! 3. Nest each later hop's Create inside Relay cells so it travels through
//!    the hops that are already established
//! 4. Verify every Created/Extended reply before using the hop's key
//!
//! Layering rule: the layer addressed *to* hop `j` is encrypted with the key
//! of hop `j - 1`, which is the relay that peels it. The outermost layer is
//! always encrypted with the entry relay's key.

use super::cell::{
    Cell, CreateCell, DataCell, ExtendCell, Payload, RelayCell, RelaySecret,
};
use super::crypto::{self, HandshakeInitiator, SymmetricKey};
use super::router::{Route, Router, RouterPool};
use super::CircId;
use crate::error::{OnionError, Result};
use std::fmt;

/// Per-hop client state
struct Hop {
    router: Router,
    /// Ephemeral handshake awaiting this hop's reply
    handshake: Option<HandshakeInitiator>,
    /// Circuit key, once the hop is verified
    key: Option<SymmetricKey>,
}

/// A client circuit: ordered hops sharing one initial circuit id
pub struct Circuit {
    pub id: CircId,
    hops: Vec<Hop>,
}

/// Result of peeling return-path layers
#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    /// Number of Relay layers removed
    pub layers: usize,
    pub payload: Payload,
}

impl Circuit {
    pub fn new(id: CircId, routers: Vec<Router>) -> Self {
        let hops = routers
            .into_iter()
            .map(|router| Hop {
                router,
                handshake: None,
                key: None,
            })
            .collect();
        Self { id, hops }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn routers(&self) -> Vec<&Router> {
        self.hops.iter().map(|h| &h.router).collect()
    }

    pub fn router(&self, hop: usize) -> Result<&Router> {
        self.hops
            .get(hop)
            .map(|h| &h.router)
            .ok_or_else(|| OnionError::Internal(format!("circuit has no hop {}", hop)))
    }

    /// The relay the client talks to directly
    pub fn entry(&self) -> Result<&Router> {
        self.router(0)
    }

    /// Number of hops, counted from the entry, whose keys are verified
    pub fn established_hops(&self) -> usize {
        self.hops.iter().take_while(|h| h.key.is_some()).count()
    }

    pub fn is_established(&self) -> bool {
        !self.hops.is_empty() && self.established_hops() == self.hops.len()
    }

    pub fn hop_key(&self, hop: usize) -> Option<&SymmetricKey> {
        self.hops.get(hop).and_then(|h| h.key.as_ref())
    }

    fn key_for(&self, hop: usize) -> Result<&SymmetricKey> {
        self.hop_key(hop).ok_or_else(|| {
            OnionError::CircuitNotReady(format!("hop {} of circuit {} has no key", hop, self.id))
        })
    }

    /// Finish the handshake for `hop` from its Created/Extended values
    ///
    /// Rejects empty (failed) replies and confirmation hash mismatches; the
    /// hop's key is only stored once the hash checks out.
    pub fn complete_hop(&mut self, hop: usize, g_y: &[u8], k_hash: &[u8]) -> Result<()> {
        let circ_id = self.id;
        let state = self
            .hops
            .get_mut(hop)
            .ok_or_else(|| OnionError::Internal(format!("circuit has no hop {}", hop)))?;
        let handshake = state.handshake.take().ok_or_else(|| {
            OnionError::CircuitNotReady(format!("no pending handshake for hop {}", hop))
        })?;

        if g_y.is_empty() && k_hash.is_empty() {
            return Err(OnionError::HandshakeFailed(format!(
                "{} could not decrypt the Create for circuit {}",
                state.router, circ_id
            )));
        }

        let shared = handshake.derive(g_y)?;
        if !crypto::verify_confirmation(&shared, k_hash) {
            log::warn!("⚠️  Key confirmation mismatch from {} (hop {})", state.router, hop);
            return Err(OnionError::KeyConfirmationFailed { hop });
        }

        log::info!("  ✓ Hop {} ({}) established", hop, state.router);
        state.key = Some(shared);
        Ok(())
    }

    /// Wrap `inner` so that hop `through_hop` unwraps it and sends it to `dest`
    ///
    /// Requires keys for hops `0..=through_hop`. The result is sent to the
    /// entry relay.
    pub fn onion_wrap(&self, through_hop: usize, dest: &Route, inner: Cell) -> Result<Cell> {
        if through_hop >= self.hops.len() {
            return Err(OnionError::Internal(format!(
                "cannot wrap through hop {} of a {}-hop circuit",
                through_hop,
                self.hops.len()
            )));
        }

        let mut cell = inner;
        let mut dest = dest.clone();
        for hop in (0..=through_hop).rev() {
            let key = self.key_for(hop)?;
            let secret = RelaySecret::forward(&dest, cell);
            cell = Cell::Relay(RelayCell::seal(self.id, &secret, key, crypto::random_iv())?);
            dest = self.hops[hop].router.route();
        }
        Ok(cell)
    }

    /// Peel return-path layers, hop 0 first, until a non-Relay payload appears
    pub fn peel(&self, cell: Cell) -> Result<Unwrapped> {
        let mut layers = 0;
        let mut current = cell;
        loop {
            let relay = match current {
                Cell::Relay(relay) => relay,
                other => {
                    return Ok(Unwrapped {
                        layers,
                        payload: Payload::Cell(other),
                    })
                }
            };

            let secret = relay.open(self.key_for(layers)?)?;
            layers += 1;
            match secret.child {
                Payload::Cell(inner) => current = inner,
                opaque @ Payload::Opaque(_) => {
                    return Ok(Unwrapped {
                        layers,
                        payload: opaque,
                    })
                }
            }
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("routers", &self.routers())
            .field("established_hops", &self.established_hops())
            .finish()
    }
}

/// Builds circuits on behalf of a client reachable at `origin`
#[derive(Debug, Clone)]
pub struct CircuitBuilder {
    origin: Route,
}

impl CircuitBuilder {
    /// `origin` is where the entry relay sends its Created reply
    pub fn new(origin: Route) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &Route {
        &self.origin
    }

    /// Choose `count` relays and a random circuit id
    pub fn build_circuit(&self, pool: &RouterPool, count: usize) -> Result<Circuit> {
        let routers = pool.build_circuit(count)?;
        let circuit = Circuit::new(CircId::random(), routers);
        log::info!("🔧 Building circuit {} ({} hops)", circuit.id, circuit.len());
        Ok(circuit)
    }

    /// Start a fresh handshake with `hop` and return its Create cell
    ///
    /// Replaces any pending handshake for that hop.
    pub fn construct_create_cell(&self, circuit: &mut Circuit, hop: usize) -> Result<CreateCell> {
        let circ_id = circuit.id;
        let state = circuit
            .hops
            .get_mut(hop)
            .ok_or_else(|| OnionError::Internal(format!("circuit has no hop {}", hop)))?;

        let handshake = HandshakeInitiator::new();
        let identity = state.router.identity_key()?;
        let sealed = crypto::hybrid_encrypt(&handshake.public_bytes(), &identity)?;
        log::debug!(
            "Create for hop {} ({}), gX {}",
            hop,
            state.router,
            crypto::fingerprint(&handshake.public_bytes())
        );
        state.handshake = Some(handshake);

        Ok(CreateCell {
            circ_id,
            encrypted_sym_key: sealed.wrapped_key,
            g_x: sealed.ciphertext,
            src_addr: self.origin.addr.clone(),
            src_port: self.origin.port,
        })
    }

    /// One Create cell per hop, in hop order
    pub fn construct_create_cells(&self, circuit: &mut Circuit) -> Result<Vec<CreateCell>> {
        (0..circuit.len())
            .map(|hop| self.construct_create_cell(circuit, hop))
            .collect()
    }

    /// The message that delivers `create` to `hop`
    ///
    /// The entry's Create goes out as-is. For later hops the Create is
    /// wrapped once per established hop before it.
    pub fn nest_relay_cell(&self, circuit: &Circuit, hop: usize, create: CreateCell) -> Result<Cell> {
        if hop == 0 {
            return Ok(Cell::Create(create));
        }
        let dest = circuit.router(hop)?.route();
        circuit.onion_wrap(hop - 1, &dest, Cell::Create(create))
    }

    /// Nested messages for every hop beyond the entry, in hop order
    ///
    /// All earlier hops must already be established; use
    /// [`CircuitBuilder::nest_relay_cell`] to go one hop at a time.
    pub fn nest_relay_cells(&self, circuit: &Circuit, creates: Vec<CreateCell>) -> Result<Vec<Cell>> {
        creates
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(hop, create)| self.nest_relay_cell(circuit, hop, create))
            .collect()
    }

    /// Extend variant: ask hop `hop - 1` to run the handshake with `hop`
    pub fn construct_extend_cell(&self, circuit: &mut Circuit, hop: usize) -> Result<Cell> {
        if hop == 0 {
            return Err(OnionError::Internal(
                "the entry hop is created directly, not extended".into(),
            ));
        }
        let create = self.construct_create_cell(circuit, hop)?;
        let target = circuit.router(hop)?.route();
        let extend = ExtendCell {
            circ_id: circuit.id,
            addr: target.addr.clone(),
            port: target.port,
            encrypted_sym_key: create.encrypted_sym_key,
            g_x: create.g_x,
        };
        circuit.onion_wrap(hop - 1, &target, Cell::Extend(extend))
    }

    /// Wrap application data for delivery by the exit hop
    pub fn wrap_data(&self, circuit: &Circuit, data: DataCell) -> Result<Cell> {
        if !circuit.is_established() {
            return Err(OnionError::CircuitNotReady(format!(
                "circuit {} has {}/{} hops",
                circuit.id,
                circuit.established_hops(),
                circuit.len()
            )));
        }
        let server = data.server();
        circuit.onion_wrap(circuit.len() - 1, &server, Cell::Data(data))
    }
}
