//! Router identities and path selection
//!
//! Defines the relays a client may route through and picks the hops of a
//! circuit uniformly at random from the configured pool.

use super::crypto;
use crate::error::{OnionError, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use x25519_dalek::PublicKey;

/// Number of hops in a client circuit
pub const ROUTER_COUNT: usize = 3;

/// A network endpoint (`addr:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub addr: String,
    pub port: u16,
}

impl Route {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl std::str::FromStr for Route {
    type Err = OnionError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, port) = s
            .rsplit_once(':')
            .ok_or_else(|| OnionError::Config(format!("expected addr:port, got {:?}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| OnionError::Config(format!("invalid port in {:?}", s)))?;
        Ok(Route::new(addr, port))
    }
}

/// A relay from the router pool file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    /// Listening address
    pub addr: String,

    /// Listening port
    pub port: u16,

    /// Base64 X25519 long-term public key
    pub public_key: String,
}

impl Router {
    pub fn new(addr: impl Into<String>, port: u16, public_key: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            port,
            public_key: public_key.into(),
        }
    }

    pub fn route(&self) -> Route {
        Route::new(self.addr.clone(), self.port)
    }

    /// Decode the long-term key used to wrap Create handshakes
    pub fn identity_key(&self) -> Result<PublicKey> {
        crypto::parse_public_key(&self.public_key)
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// The set of relays a client may choose from
#[derive(Debug, Clone, Default)]
pub struct RouterPool {
    routers: Vec<Router>,
}

impl RouterPool {
    /// Build a pool, keeping the first entry for each `addr:port`
    pub fn new(routers: Vec<Router>) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(routers.len());
        for router in routers {
            if seen.insert(router.route()) {
                unique.push(router);
            } else {
                log::warn!("Ignoring duplicate router entry {}", router);
            }
        }
        Self { routers: unique }
    }

    pub fn routers(&self) -> &[Router] {
        &self.routers
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Select `count` distinct routers uniformly at random
    ///
    /// The returned order is the hop order: index 0 is the entry relay.
    pub fn build_circuit(&self, count: usize) -> Result<Vec<Router>> {
        if self.routers.len() < count {
            return Err(OnionError::InsufficientRouters {
                needed: count,
                available: self.routers.len(),
            });
        }

        let mut rng = rand::thread_rng();
        let selected: Vec<Router> = self
            .routers
            .choose_multiple(&mut rng, count)
            .cloned()
            .collect();

        log::debug!(
            "Selected path: {}",
            selected
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(selected)
    }
}
