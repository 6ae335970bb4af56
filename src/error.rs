//! Error types for the messaging core.
//!
//! Centralizes every failure the crate can surface so callers handle one
//! taxonomy: transport failures on the send/publish path, serialization
//! failures, dead-letter storage failures, provisioning failures (fatal at
//! startup) and configuration errors.

use thiserror::Error;

/// Errors surfaced by the messaging core.
#[derive(Error, Debug)]
pub enum BusError {
    /// The underlying broker call failed. Send/publish failures are
    /// surfaced directly; the retry engine only applies to consumption.
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    /// A payload could not be serialized for the wire.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The dead-letter store rejected an operation.
    #[error("dead-letter storage failure: {0}")]
    Storage(#[from] sled::Error),

    /// Provisioning a queue, topic or binding failed. The system cannot
    /// guarantee delivery without its topology, so this is fatal at startup.
    #[error("failed to provision messaging entity '{entity}': {reason}")]
    Provisioning { entity: String, reason: String },

    /// The messaging configuration is invalid.
    #[error("invalid messaging configuration: {0}")]
    Configuration(String),
}

impl BusError {
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        BusError::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn provisioning(entity: impl Into<String>, reason: impl ToString) -> Self {
        BusError::Provisioning {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for messaging operations.
pub type BusResult<T> = Result<T, BusError>;
