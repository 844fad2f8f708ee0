//! Error types for the sync engine

use crate::entity::EntityKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A synchronization is already running on this store. Requests are never queued.
    #[error("Synchronization already in progress")]
    Busy,

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The conflict resolver chose to abort the merge.
    #[error("Merge aborted by conflict resolver for {kind} '{id}' (version {uuid})")]
    Aborted {
        kind: EntityKind,
        id: String,
        uuid: Uuid,
    },

    /// A revision delivered by the remote could not be merged locally.
    #[error("Merge failed: {0}")]
    MergeFailed(String),

    /// Opaque failure reported by a remote peer or its transport.
    #[error("Transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
