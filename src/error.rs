// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (admission, transport, storage)
//! and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Peer unreachable, connection dropped, call timed out |
//! | `UpstreamUnavailable` | Yes | Upstream has no data or doesn't host the database yet |
//! | `DbNotFound` | No | Database is not registered on this host |
//! | `DbPreExist` | No | Database name is already registered |
//! | `WriteToFollower` | No | Write submitted to a non-leader database |
//! | `WriteError` | No | Storage engine rejected the write |
//! | `Timeout` | No | Mode-2 write expired waiting for a follower ack |
//! | `ApplyMismatch` | No | Replicated batch does not continue the local sequence |
//! | `Protocol` | No | Malformed frame or payload from a peer |
//! | `Config` | No | Configuration invalid |
//! | `Io` | No | Socket/listener setup failure |
//! | `Shutdown` | No | Host is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to determine if an operation
//! should be retried with backoff. The pull loop retries retryable errors
//! indefinitely; everything else is surfaced to the caller.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Database is not registered on this host.
    #[error("db not found")]
    DbNotFound,

    /// A database with this name is already registered.
    ///
    /// The incumbent is left untouched.
    #[error("db already exists")]
    DbPreExist,

    /// Write submitted to a FOLLOWER or OBSERVER database.
    ///
    /// Only leaders accept writes; route the write to the leader instead.
    #[error("write to non-leader database")]
    WriteToFollower,

    /// The storage engine rejected a write.
    #[error("write error: {0}")]
    WriteError(String),

    /// A mode-2 write expired before any follower acknowledged it.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The upstream cannot serve updates yet.
    ///
    /// Returned by a non-leader upstream that is itself still empty.
    /// The pull loop retries; repeated occurrences feed upstream-reset
    /// detection.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A replicated batch does not continue the local sequence.
    ///
    /// Fatal for the database: the pull loop stops until the database is
    /// removed and re-added. Applying out of order would corrupt the copy.
    #[error("apply mismatch: expected sequence {expected}, storage is at {actual}")]
    ApplyMismatch { expected: u64, actual: u64 },

    /// Peer connection failure or call timeout.
    ///
    /// Retryable with the configured pull-error delay.
    #[error("transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// Malformed frame or payload received from a peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket or listener setup failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Host is shutting down.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a peer address.
    pub fn transport(peer: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::UpstreamUnavailable(_) => true,
            Self::DbNotFound => false,
            Self::DbPreExist => false,
            Self::WriteToFollower => false,
            Self::WriteError(_) => false,
            Self::Timeout(_) => false,
            Self::ApplyMismatch { .. } => false,
            Self::Protocol(_) => false,
            Self::Config(_) => false,
            Self::Io(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
