//! Store configuration

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Configuration for a care store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Human readable store name, used in logs
    pub name: String,
    /// Device identity. Generated on first open when absent.
    pub device_id: Option<Uuid>,
    /// Run a merge synchronization whenever the remote asks for one
    pub automatic_synchronization: bool,
    /// SQLite persistence. Without it the store lives in memory only.
    pub database: Option<DatabaseConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "carestore".to_string(),
            device_id: None,
            automatic_synchronization: false,
            database: None,
        }
    }
}

impl StoreConfig {
    /// In-memory store with a fixed device identity
    pub fn in_memory(device_id: Uuid) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::default()
        }
    }

    /// Load configuration from an optional file and `CARESTORE__*` environment
    /// variables. Environment values override the file.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("CARESTORE").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

/// Configuration for the local database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Overwrite freed pages so removed records do not linger on disk
    pub enable_secure_delete: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: "carestore.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

impl DatabaseConfig {
    pub fn at(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}
