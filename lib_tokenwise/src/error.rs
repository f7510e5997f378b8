//! Error taxonomy shared by the engine.
//!
//! RPC failures split into transient ones (retried by the client) and permanent
//! ones (surfaced at once). Store failures never escape a monitor cycle; they are
//! logged where they happen.

use thiserror::Error;

/// Errors produced while talking to the RPC Source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// HTTP 429 from the upstream provider.
    #[error("rate limited by RPC source")]
    RateLimited,
    /// Connection refused, reset, non-2xx status and similar.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The attempt exceeded its per-call deadline.
    #[error("RPC call timed out")]
    Timeout,
    /// The remote side answered with a JSON-RPC error object.
    #[error("RPC error ({code}): {message}")]
    Remote { code: i64, message: String },
    /// The response could not be decoded into the expected shape.
    #[error("malformed RPC response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Transient errors are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::RateLimited | RpcError::Transport(_) | RpcError::Timeout)
    }
}

/// Errors produced by a `Store` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A record failed validation before it was written.
    #[error("record rejected: {0}")]
    Rejected(String),
    /// A stored document no longer matches its record shape.
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// A subscriber whose connection is gone. Only that subscriber is dropped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("subscriber {0} is unreachable")]
pub struct SubscriberUnreachable(pub crate::core::registry::SubscriberId);
