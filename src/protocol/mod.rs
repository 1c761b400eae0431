//! Onion routing protocol
//!
//! This module implements the protocol shared by relays and clients:
//! - Cryptography (hybrid wrap, ECDH handshake, AES-CBC layers)
//! - Cell protocol (newline-delimited JSON cells)
//! - Router identities and path selection
//! - Client-side circuit construction and onion layering

mod cell;
mod circuit_builder;
pub mod crypto;
mod router;
pub(crate) mod serde_helpers;

pub use cell::{
    Cell, CircId, CreateCell, CreatedCell, DataCell, DestroyCell, ExtendCell, ExtendedCell,
    Payload, RelayCell, RelaySecret,
};
pub use circuit_builder::{Circuit, CircuitBuilder, Unwrapped};
pub use crypto::{IdentityKeyPair, SymmetricKey};
pub use router::{Route, Router, RouterPool, ROUTER_COUNT};
