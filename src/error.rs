//! Error types for the onion router
//!
//! This module provides the error taxonomy shared by relays and the client proxy:
//! - Transport errors (connection refused, I/O failure, timeouts)
//! - Malformed-message errors (unparseable JSON, missing or unknown `type`)
//! - Cryptographic errors (decrypt or handshake failure)
//! - Circuit/routing errors (table lookup misses, circuit not ready)
//!
//! None of these are fatal to a relay: workers log the error and drop the cell.

use crate::protocol::CircId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OnionError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transport errors (1xx)
    ConnectionFailed = 100,
    Timeout = 101,
    Io = 102,

    // Malformed-message errors (2xx)
    MalformedCell = 200,
    MissingCellType = 201,
    UnknownCellType = 202,
    UnexpectedCell = 203,

    // Cryptographic errors (3xx)
    CryptoError = 300,
    HandshakeFailed = 301,
    KeyConfirmationFailed = 302,

    // Circuit/routing errors (4xx)
    UnknownCircuit = 400,
    CircuitNotReady = 401,
    InsufficientRouters = 402,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type
#[derive(Error, Debug, Clone)]
pub enum OnionError {
    // ===== Transport Errors =====
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ===== Malformed-Message Errors =====
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Cell has no type field")]
    MissingCellType,

    #[error("Unknown cell type: {0}")]
    UnknownCellType(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Key confirmation hash mismatch for hop {hop}")]
    KeyConfirmationFailed { hop: usize },

    // ===== Circuit/Routing Errors =====
    #[error("Unknown circuit {0}")]
    UnknownCircuit(CircId),

    #[error("Circuit not ready: {0}")]
    CircuitNotReady(String),

    #[error("Router pool has {available} routers, need {needed}")]
    InsufficientRouters { needed: usize, available: usize },

    // ===== Configuration Errors =====
    #[error("Config error: {0}")]
    Config(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OnionError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Transport
            OnionError::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            OnionError::Timeout(_) => ErrorCode::Timeout,
            OnionError::Io(_) => ErrorCode::Io,

            // Malformed
            OnionError::MalformedCell(_) => ErrorCode::MalformedCell,
            OnionError::MissingCellType => ErrorCode::MissingCellType,
            OnionError::UnknownCellType(_) => ErrorCode::UnknownCellType,
            OnionError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,

            // Crypto
            OnionError::Crypto(_) => ErrorCode::CryptoError,
            OnionError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            OnionError::KeyConfirmationFailed { .. } => ErrorCode::KeyConfirmationFailed,

            // Circuit
            OnionError::UnknownCircuit(_) => ErrorCode::UnknownCircuit,
            OnionError::CircuitNotReady(_) => ErrorCode::CircuitNotReady,
            OnionError::InsufficientRouters { .. } => ErrorCode::InsufficientRouters,

            // Config
            OnionError::Config(_) => ErrorCode::ConfigError,

            // Internal
            OnionError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the operation could succeed if simply tried again
    ///
    /// Only transport failures qualify. The protocol never retries on its own;
    /// this is for callers such as the proxy binary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OnionError::ConnectionFailed { .. } | OnionError::Timeout(_) | OnionError::Io(_)
        )
    }

    /// Whether the cell that caused this error must simply be dropped
    /// because the relay has no route for it
    pub fn is_unroutable(&self) -> bool {
        matches!(self, OnionError::UnknownCircuit(_))
    }

    /// Whether this error came from an unparseable or unrecognised message
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            OnionError::MalformedCell(_)
                | OnionError::MissingCellType
                | OnionError::UnknownCellType(_)
                | OnionError::UnexpectedCell { .. }
        )
    }
}

impl From<std::io::Error> for OnionError {
    fn from(err: std::io::Error) -> Self {
        OnionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OnionError {
    fn from(err: serde_json::Error) -> Self {
        OnionError::MalformedCell(err.to_string())
    }
}
