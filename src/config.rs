//! Configuration files
//!
//! All configuration is JSON with camelCase keys:
//! - relay: `{"addr", "port", "privateKey", "verbose", "maxWorkers", "ioTimeoutSecs"}`
//! - proxy: `{"addr", "port", "verbose", "replyTimeoutSecs", "maxReaders"}`
//! - router pool: `{"routers": [{"addr", "port", "publicKey"}]}`

use crate::error::{OnionError, Result};
use crate::protocol::{IdentityKeyPair, Route, Router, RouterPool};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_max_workers() -> usize {
    64
}

fn default_max_readers() -> usize {
    16
}

fn default_timeout_secs() -> u64 {
    30
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OnionError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| OnionError::Config(format!("Invalid {}: {}", path.display(), e)))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| OnionError::Internal(format!("Config serialization failed: {}", e)))?;
    std::fs::write(path, text + "\n")
        .map_err(|e| OnionError::Config(format!("Cannot write {}: {}", path.display(), e)))
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Address to listen on and to advertise as the source of forwarded Creates
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Listening port (0 picks an ephemeral port)
    pub port: u16,

    /// Base64 X25519 secret; generated on first run when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default)]
    pub verbose: bool,

    /// Maximum connections handled concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Bound on reads and on the exit hop's wait for a destination reply
    #[serde(default = "default_timeout_secs")]
    pub io_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: 5050,
            private_key: None,
            verbose: false,
            max_workers: default_max_workers(),
            io_timeout_secs: default_timeout_secs(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(path.as_ref(), self)
    }

    pub fn route(&self) -> Route {
        Route::new(self.addr.clone(), self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// The relay identity, which must already be configured
    pub fn identity(&self) -> Result<IdentityKeyPair> {
        let encoded = self
            .private_key
            .as_deref()
            .ok_or_else(|| OnionError::Config("relay config has no privateKey".into()))?;
        IdentityKeyPair::from_secret_b64(encoded)
    }

    /// Load the identity, generating one if none is configured
    ///
    /// Returns the identity and whether it was just generated, in which case
    /// the caller should save the config and publish the public key.
    pub fn ensure_identity(&mut self) -> Result<(IdentityKeyPair, bool)> {
        if self.private_key.is_some() {
            return Ok((self.identity()?, false));
        }
        let identity = IdentityKeyPair::generate();
        self.private_key = Some(identity.secret_b64());
        log::info!("🔐 Generated relay identity {}", identity.public_b64());
        Ok((identity, true))
    }
}

/// Client proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Address relays use to reach the proxy
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Port the proxy listens on for replies (0 picks an ephemeral port)
    pub port: u16,

    #[serde(default)]
    pub verbose: bool,

    /// How long to wait for each Created / data reply
    #[serde(default = "default_timeout_secs")]
    pub reply_timeout_secs: u64,

    /// Reply connections read concurrently
    #[serde(default = "default_max_readers")]
    pub max_readers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: 6060,
            verbose: false,
            reply_timeout_secs: default_timeout_secs(),
            max_readers: default_max_readers(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(path.as_ref(), self)
    }

    pub fn route(&self) -> Route {
        Route::new(self.addr.clone(), self.port)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs.max(1))
    }
}

/// Router pool file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutersConfig {
    pub routers: Vec<Router>,
}

impl RoutersConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(path.as_ref(), self)
    }

    /// Validate every key and build the selection pool
    pub fn into_pool(self) -> Result<RouterPool> {
        for router in &self.routers {
            router.identity_key().map_err(|e| {
                OnionError::Config(format!("router {} has an invalid publicKey: {}", router, e))
            })?;
        }
        Ok(RouterPool::new(self.routers))
    }
}
