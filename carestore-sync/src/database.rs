//! Local SQLite persistence for the care store
//!
//! The in-memory state is authoritative while the store is open. Every
//! committed transaction writes its [`ChangeSet`] here inside one SQLite
//! transaction, and the state is loaded back in full on open.

use crate::config::DatabaseConfig;
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use crate::knowledge::KnowledgeVector;
use crate::store::{ChangeSet, StoreState, StoredEntity};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

const DEVICE_ID_KEY: &str = "device_id";

/// Local database handle
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (or create) the database file and make sure the schema exists
    pub async fn new(config: &DatabaseConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let secure_delete = if config.enable_secure_delete { "ON" } else { "OFF" };

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(true)
            .pragma("secure_delete", secure_delete);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local database");
        Ok(db)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_vector (
                device_id TEXT PRIMARY KEY,
                clock INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                uuid TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                logical_id TEXT,
                clock INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_clock ON entities(clock)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_logical ON entities(kind, logical_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record the identity of a freshly created store
    pub async fn initialize_device(&self, device_id: Uuid) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO store_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(DEVICE_ID_KEY)
        .bind(device_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the persisted state, or `None` if this database was never initialized
    pub async fn load(&self) -> SyncResult<Option<StoreState>> {
        let Some(row) = sqlx::query("SELECT value FROM store_metadata WHERE key = ?")
            .bind(DEVICE_ID_KEY)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let device_id = parse_uuid(&row.try_get::<String, _>("value")?)?;

        let mut knowledge = Vec::new();
        for row in sqlx::query("SELECT device_id, clock FROM knowledge_vector")
            .fetch_all(&self.pool)
            .await?
        {
            let device: String = row.try_get("device_id")?;
            let clock: i64 = row.try_get("clock")?;
            knowledge.push((parse_uuid(&device)?, to_clock(clock)?));
        }

        let mut entities = Vec::new();
        for row in sqlx::query("SELECT clock, payload FROM entities")
            .fetch_all(&self.pool)
            .await?
        {
            let clock: i64 = row.try_get("clock")?;
            let payload: String = row.try_get("payload")?;
            entities.push(StoredEntity {
                value: serde_json::from_str::<Entity>(&payload)?,
                clock: to_clock(clock)?,
            });
        }

        tracing::debug!(
            device_id = %device_id,
            entities = entities.len(),
            "Loaded persisted store state"
        );
        StoreState::restore(device_id, KnowledgeVector::from_entries(knowledge), entities).map(Some)
    }

    /// Write the effect of a committed transaction
    pub async fn persist(&self, state: &StoreState, changes: &ChangeSet) -> SyncResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        if changes.reset {
            sqlx::query("DELETE FROM entities").execute(&mut *tx).await?;
        }

        for uuid in &changes.touched {
            match state.get(*uuid) {
                Some(stored) => {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO entities (
                            uuid, kind, logical_id, clock, payload, updated_at
                        ) VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(uuid.to_string())
                    .bind(stored.value.kind().as_str())
                    .bind(stored.value.logical_id())
                    .bind(to_column(stored.clock)?)
                    .bind(serde_json::to_string(&stored.value)?)
                    .bind(now.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM entities WHERE uuid = ?")
                        .bind(uuid.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        if changes.knowledge_changed {
            sqlx::query("DELETE FROM knowledge_vector")
                .execute(&mut *tx)
                .await?;
            let knowledge = state.knowledge_vector();
            for device in knowledge.devices() {
                sqlx::query("INSERT INTO knowledge_vector (device_id, clock) VALUES (?, ?)")
                    .bind(device.to_string())
                    .bind(to_column(knowledge.clock(device))?)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        tracing::trace!(
            touched = changes.touched.len(),
            reset = changes.reset,
            knowledge = changes.knowledge_changed,
            "Persisted store changes"
        );
        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reclaim space left behind by removed versions
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close database connection
    pub async fn close(self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| SyncError::InvalidValue(format!("Invalid UUID '{}': {}", value, e)))
}

fn to_clock(value: i64) -> SyncResult<u64> {
    u64::try_from(value)
        .map_err(|_| SyncError::InvalidValue(format!("Negative clock value: {}", value)))
}

fn to_column(clock: u64) -> SyncResult<i64> {
    i64::try_from(clock)
        .map_err(|_| SyncError::InvalidValue(format!("Clock value out of range: {}", clock)))
}
