//! Error taxonomy for the datafeed server.
//!
//! Containment policy: `Validation` and `Parse` are per-request/per-message
//! and never take the coordinator down; `Connection` is fatal at startup
//! and propagates to the bootstrap layer; `NoPersistenceModule` fails a
//! single message (reported, not retried) while the coordinator keeps
//! running. The core never retries routing -- at-least-once delivery, if
//! wanted, belongs to the broker.

use thiserror::Error;

/// Errors surfaced by the coordinator, registry, broker, and clients.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A registration payload failed validation (missing `serviceClass`).
    #[error("invalid registration: {reason}")]
    Validation {
        /// What was wrong with the payload.
        reason: String,
    },

    /// The broker (or its transport) is unreachable or refused the URL.
    #[error("broker connection failed: {reason}")]
    Connection {
        /// Why the connection attempt failed.
        reason: String,
    },

    /// A message arrived with no persistence module to land in.
    #[error("no persistence module registered; message has nowhere to land")]
    NoPersistenceModule,

    /// Message bytes did not decode as JSON.
    #[error("malformed message payload")]
    Parse(#[source] serde_json::Error),

    /// The document store failed an operation.
    #[error("storage failure: {0}")]
    Storage(anyhow::Error),

    /// The broker context was closed while a socket was still in use.
    #[error("broker context closed")]
    BrokerClosed,
}

impl OrchestratorError {
    /// Shorthand for a [`OrchestratorError::Validation`] error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`OrchestratorError::Connection`] error.
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }
}
