//! Circuit table
//!
//! Per-relay state shared by every connection worker. Five independent
//! concurrent maps, all keyed by circuit ids local to this relay:
//!
//! | map        | key        | value                        |
//! |------------|------------|------------------------------|
//! | `keys`     | inCircID   | circuit key                  |
//! | `ivs`      | inCircID   | last IV seen from upstream   |
//! | `inbound`  | inCircID   | upstream `addr:port`         |
//! | `outbound` | outCircID  | downstream `addr:port`       |
//! | `ask`      | outCircID  | inCircID it extends          |
//!
//! Each map operation is atomic per key. Operations that touch several maps
//! (minting an outbound id, destroy) are not transactional: a Create or
//! Relay racing with a Destroy on the same circuit may leave a short-lived
//! entry behind or miss one. That window is accepted; there is no global
//! lock.

use crate::error::{OnionError, Result};
use crate::protocol::crypto::Iv;
use crate::protocol::{CircId, Route, SymmetricKey};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

/// Which way a cell with a given circuit id is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Known in `inbound`: away from the client
    Forward,
    /// Known in `outbound`: back toward the client
    Backward,
    /// Not known to this relay
    Unknown,
}

/// Entry counts, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableSizes {
    pub keys: usize,
    pub ivs: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub ask: usize,
}

/// Shared circuit state of one relay
#[derive(Debug, Default)]
pub struct CircuitTable {
    keys: DashMap<CircId, SymmetricKey>,
    ivs: DashMap<CircId, Iv>,
    inbound: DashMap<CircId, Route>,
    outbound: DashMap<CircId, Route>,
    ask: DashMap<CircId, CircId>,
    /// Outbound ids created by an Extend whose Created is still due
    pending_extend: DashSet<CircId>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed handshake for an upstream circuit
    ///
    /// Refuses ids this relay already uses for a downstream segment, so an
    /// id never ends up in both `inbound` and `outbound`.
    pub fn register_inbound(&self, id: CircId, key: SymmetricKey, upstream: Route) -> Result<()> {
        if self.outbound.contains_key(&id) {
            return Err(OnionError::HandshakeFailed(format!(
                "circuit {} is already an outbound id here",
                id
            )));
        }
        self.keys.insert(id, key);
        self.inbound.insert(id, upstream);
        Ok(())
    }

    /// Pick a fresh outbound id for a segment extending `inbound_id`
    ///
    /// `ask` is written before `outbound` so any worker that sees the
    /// outbound entry can also map it back.
    pub fn mint_outbound(&self, inbound_id: CircId, downstream: Route) -> CircId {
        loop {
            let candidate = CircId::random();
            if self.inbound.contains_key(&candidate) {
                continue;
            }
            if let Entry::Vacant(slot) = self.outbound.entry(candidate) {
                self.ask.insert(candidate, inbound_id);
                slot.insert(downstream);
                return candidate;
            }
        }
    }

    pub fn direction(&self, id: CircId) -> Direction {
        if self.inbound.contains_key(&id) {
            Direction::Forward
        } else if self.outbound.contains_key(&id) {
            Direction::Backward
        } else {
            Direction::Unknown
        }
    }

    pub fn key(&self, id: CircId) -> Option<SymmetricKey> {
        self.keys.get(&id).map(|k| k.value().clone())
    }

    /// Remember the IV of the latest forward cell; last writer wins
    pub fn set_iv(&self, id: CircId, iv: Iv) {
        self.ivs.insert(id, iv);
    }

    pub fn iv(&self, id: CircId) -> Option<Iv> {
        self.ivs.get(&id).map(|iv| *iv.value())
    }

    pub fn upstream(&self, id: CircId) -> Option<Route> {
        self.inbound.get(&id).map(|r| r.value().clone())
    }

    pub fn downstream(&self, out_id: CircId) -> Option<Route> {
        self.outbound.get(&out_id).map(|r| r.value().clone())
    }

    /// `ask` lookup: the inbound id a downstream segment belongs to
    pub fn inbound_for(&self, out_id: CircId) -> Option<CircId> {
        self.ask.get(&out_id).map(|id| *id.value())
    }

    /// Reverse `ask` lookup: a downstream segment of `inbound_id`
    pub fn outbound_for(&self, inbound_id: CircId) -> Option<CircId> {
        self.ask
            .iter()
            .find(|entry| *entry.value() == inbound_id)
            .map(|entry| *entry.key())
    }

    pub fn mark_pending_extend(&self, out_id: CircId) {
        self.pending_extend.insert(out_id);
    }

    /// Clear and report the pending-extend mark of `out_id`
    pub fn take_pending_extend(&self, out_id: CircId) -> bool {
        self.pending_extend.remove(&out_id).is_some()
    }

    /// Tear down `id` and return the downstream segments to notify
    ///
    /// Removes the circuit's key, IV and upstream route, every `ask` entry
    /// pointing at it and the matching `outbound` entries. Entries of other
    /// circuits are left alone.
    pub fn destroy(&self, id: CircId) -> Vec<(CircId, Route)> {
        // Collect first so no `ask` shard lock is held while removing
        let out_ids: Vec<CircId> = self
            .ask
            .iter()
            .filter(|entry| *entry.value() == id)
            .map(|entry| *entry.key())
            .collect();

        let mut downstream = Vec::with_capacity(out_ids.len());
        for out_id in out_ids {
            self.ask.remove(&out_id);
            self.pending_extend.remove(&out_id);
            if let Some((_, route)) = self.outbound.remove(&out_id) {
                downstream.push((out_id, route));
            }
        }

        self.keys.remove(&id);
        self.ivs.remove(&id);
        self.inbound.remove(&id);
        downstream
    }

    pub fn sizes(&self) -> TableSizes {
        TableSizes {
            keys: self.keys.len(),
            ivs: self.ivs.len(),
            inbound: self.inbound.len(),
            outbound: self.outbound.len(),
            ask: self.ask.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sizes() == TableSizes::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crypto;

    fn route(port: u16) -> Route {
        Route::new("127.0.0.1", port)
    }

    #[test]
    fn test_direction_by_table() {
        let table = CircuitTable::new();
        let inbound = CircId::new(10);
        table
            .register_inbound(inbound, SymmetricKey::generate(), route(6000))
            .unwrap();
        let out = table.mint_outbound(inbound, route(7001));

        assert_eq!(table.direction(inbound), Direction::Forward);
        assert_eq!(table.direction(out), Direction::Backward);
        assert_eq!(table.direction(CircId::new(11)), Direction::Unknown);
        assert_eq!(table.inbound_for(out), Some(inbound));
        assert_eq!(table.outbound_for(inbound), Some(out));
        assert_eq!(table.downstream(out), Some(route(7001)));
        assert_ne!(out, inbound);
    }

    #[test]
    fn test_outbound_id_cannot_be_registered_inbound() {
        let table = CircuitTable::new();
        let out = table.mint_outbound(CircId::new(1), route(7001));
        assert!(table
            .register_inbound(out, SymmetricKey::generate(), route(6000))
            .is_err());
        assert_eq!(table.direction(out), Direction::Backward);
    }

    #[test]
    fn test_iv_last_writer_wins() {
        let table = CircuitTable::new();
        let id = CircId::new(3);
        assert!(table.iv(id).is_none());
        let first = crypto::random_iv();
        let second = crypto::random_iv();
        table.set_iv(id, first);
        table.set_iv(id, second);
        assert_eq!(table.iv(id), Some(second));
    }

    #[test]
    fn test_destroy_removes_only_its_circuit() {
        let table = CircuitTable::new();
        let a = CircId::new(100);
        let b = CircId::new(200);
        for (id, port) in [(a, 6000), (b, 6001)] {
            table
                .register_inbound(id, SymmetricKey::generate(), route(port))
                .unwrap();
            table.set_iv(id, crypto::random_iv());
        }
        let a_out = table.mint_outbound(a, route(7001));
        let b_out = table.mint_outbound(b, route(7002));
        table.mark_pending_extend(a_out);

        let downstream = table.destroy(a);
        assert_eq!(downstream, vec![(a_out, route(7001))]);

        assert_eq!(table.direction(a), Direction::Unknown);
        assert_eq!(table.direction(a_out), Direction::Unknown);
        assert!(table.key(a).is_none());
        assert!(table.iv(a).is_none());
        assert!(!table.take_pending_extend(a_out));

        assert_eq!(table.inbound_for(b_out), Some(b));
        assert!(table.key(b).is_some());
        assert_eq!(
            table.sizes(),
            TableSizes {
                keys: 1,
                ivs: 1,
                inbound: 1,
                outbound: 1,
                ask: 1
            }
        );

        table.destroy(b);
        assert!(table.is_empty());
    }

    #[test]
    fn test_destroy_unknown_is_noop() {
        let table = CircuitTable::new();
        table
            .register_inbound(CircId::new(1), SymmetricKey::generate(), route(6000))
            .unwrap();
        let before = table.sizes();
        assert!(table.destroy(CircId::new(999)).is_empty());
        assert_eq!(table.sizes(), before);
    }
}
