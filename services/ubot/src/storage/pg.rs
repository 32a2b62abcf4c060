//! Postgres ledger.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;
use ubot_id::{NodeNumber, ResultHash};

use super::{Ledger, LedgerError, StorageKey};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/ubot".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/ubot".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Ledger backed by the `single_storage` and `multi_storage` tables.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub async fn connect(config: &DbConfig) -> Result<Self, LedgerError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to ledger database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(LedgerError::Connect)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        let candidates = [
            PathBuf::from("./migrations"),
            PathBuf::from("services/ubot/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error = None;
        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(LedgerError::Migration)?;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => LedgerError::Migration(e),
            None => LedgerError::Corrupt("no migrations directory".to_string()),
        })
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn upsert_single(&self, key: &StorageKey, data: &[u8]) -> Result<ResultHash, LedgerError> {
        let hash = ResultHash::of(data);
        sqlx::query(
            r#"
            INSERT INTO single_storage (pool_id, contract_id, storage_name, data, hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (pool_id, contract_id, storage_name)
            DO UPDATE SET data = EXCLUDED.data, hash = EXCLUDED.hash, updated_at = now()
            "#,
        )
        .bind(key.pool_id.as_bytes().as_slice())
        .bind(key.contract_id.as_bytes().as_slice())
        .bind(&key.name)
        .bind(data)
        .bind(hash.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        Ok(hash)
    }

    async fn get_single(&self, key: &StorageKey) -> Result<Option<Bytes>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT data FROM single_storage
            WHERE pool_id = $1 AND contract_id = $2 AND storage_name = $3
            "#,
        )
        .bind(key.pool_id.as_bytes().as_slice())
        .bind(key.contract_id.as_bytes().as_slice())
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        row.map(|row| {
            row.try_get::<Vec<u8>, _>("data")
                .map(Bytes::from)
                .map_err(LedgerError::Query)
        })
        .transpose()
    }

    async fn put_multi_slot(
        &self,
        key: &StorageKey,
        node: NodeNumber,
        data: &[u8],
    ) -> Result<ResultHash, LedgerError> {
        let hash = ResultHash::of(data);
        sqlx::query(
            r#"
            INSERT INTO multi_storage (pool_id, contract_id, storage_name, node_number, data, hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (pool_id, contract_id, storage_name, node_number)
            DO UPDATE SET data = EXCLUDED.data, hash = EXCLUDED.hash, updated_at = now()
            "#,
        )
        .bind(key.pool_id.as_bytes().as_slice())
        .bind(key.contract_id.as_bytes().as_slice())
        .bind(&key.name)
        .bind(i64::from(node.value()))
        .bind(data)
        .bind(hash.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        Ok(hash)
    }

    async fn get_multi(&self, key: &StorageKey) -> Result<BTreeMap<NodeNumber, Bytes>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT node_number, data FROM multi_storage
            WHERE pool_id = $1 AND contract_id = $2 AND storage_name = $3
            "#,
        )
        .bind(key.pool_id.as_bytes().as_slice())
        .bind(key.contract_id.as_bytes().as_slice())
        .bind(&key.name)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        let mut slots = BTreeMap::new();
        for row in rows {
            let number: i64 = row.try_get("node_number").map_err(LedgerError::Query)?;
            let number = u32::try_from(number)
                .map_err(|_| LedgerError::Corrupt(format!("node number {number}")))?;
            let data: Vec<u8> = row.try_get("data").map_err(LedgerError::Query)?;
            slots.insert(NodeNumber::new(number), Bytes::from(data));
        }
        Ok(slots)
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }
}
