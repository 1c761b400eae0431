//! Relay side of the overlay
//!
//! - [`CircuitTable`]: per-relay circuit state shared by all workers
//! - [`RelayEngine`]: one-cell-per-connection dispatch state machine
//! - [`RelayServer`]: accept loop with a bounded worker pool

mod engine;
mod server;
mod table;

pub use engine::{RelayEngine, DEFAULT_IO_TIMEOUT};
pub use server::RelayServer;
pub use table::{CircuitTable, Direction, TableSizes};
