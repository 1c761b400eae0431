//! # Onion Router
//!
//! A minimal onion-routing overlay: relays that forward layered cells and a
//! client proxy that builds three-hop circuits through them.
//!
//! ## Architecture
//!
//! ```text
//! OnionProxy (client)
//!   ↓  nested RELAY / CREATE cells, one TCP connection per cell
//! RelayServer → RelayEngine ↔ CircuitTable     (entry)
//!   ↓
//! RelayServer → RelayEngine ↔ CircuitTable     (middle)
//!   ↓
//! RelayServer → RelayEngine ↔ CircuitTable     (exit) → destination server
//! ```
//!
//! ## Features
//!
//! - **Per-hop keys**: X25519 handshake per hop, confirmed with SHA3-256
//! - **Hybrid Create**: the handshake value is sealed for the relay's long-term key
//! - **Layered AES-CBC**: each relay peels exactly one layer
//! - **Shared state without globals**: concurrent per-relay circuit tables
//! - **Bounded workers**: the accept loop never spawns unbounded tasks

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod transport;

pub use config::{ClientConfig, RouterConfig, RoutersConfig};
pub use error::{ErrorCode, OnionError, Result};
pub use protocol::{
    Cell, CircId, Circuit, CircuitBuilder, IdentityKeyPair, Route, Router, RouterPool,
    ROUTER_COUNT,
};
pub use proxy::OnionProxy;
pub use relay::{CircuitTable, RelayEngine, RelayServer};
pub use transport::{CellTransport, TcpTransport};
