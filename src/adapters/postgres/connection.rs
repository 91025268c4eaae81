//! Per-world-seed Postgres database management.
//!
//! Each world seed gets its own database, created lazily on startup.
//! Seed sanitization keeps names to alphanumerics and underscores,
//! mapping `-` to `n` so negative seeds stay distinguishable.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("World seed must be a non-empty string")]
    EmptyWorldSeed,
    #[error("Failed to create database: {0}")]
    DatabaseCreationFailed(#[source] sqlx::Error),
    #[error("Failed to create pool: {0}")]
    PoolCreationFailed(#[source] sqlx::Error),
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// Sanitize a world seed into a database-name-safe suffix.
/// `-` becomes `n`; anything outside `[A-Za-z0-9_]` is dropped.
pub fn sanitize_seed(seed: &str) -> String {
    seed.chars()
        .filter_map(|c| {
            if c == '-' {
                Some('n')
            } else if c.is_ascii_alphanumeric() || c == '_' {
                Some(c)
            } else {
                None
            }
        })
        .collect()
}

/// Database name for a world seed.
pub fn seed_database_name(seed: &str) -> Result<String, ConnectionError> {
    let sanitized = sanitize_seed(seed);
    if sanitized.is_empty() {
        return Err(ConnectionError::EmptyWorldSeed);
    }
    Ok(format!("base_seed_{sanitized}"))
}

/// Connect to the per-seed database, creating it if missing.
pub async fn create_seed_pool(
    admin_url: &str,
    world_seed: &str,
    config: Option<PoolConfig>,
) -> Result<PgPool, ConnectionError> {
    let config = config.unwrap_or_default();
    let database = seed_database_name(world_seed)?;

    let admin_options = PgConnectOptions::from_str(admin_url)
        .map_err(|_| ConnectionError::InvalidDatabaseUrl(admin_url.to_string()))?;

    // Lazy creation through the admin connection. Duplicate-database
    // races with another process are fine.
    {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(admin_options.clone())
            .await
            .map_err(ConnectionError::PoolCreationFailed)?;
        let create = format!("CREATE DATABASE \"{database}\"");
        if let Err(err) = sqlx::query(&create).execute(&admin_pool).await {
            if !is_duplicate_database(&err) {
                return Err(ConnectionError::DatabaseCreationFailed(err));
            }
        }
        admin_pool.close().await;
    }

    let options = admin_options.database(&database);
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(ConnectionError::PoolCreationFailed)?;

    migrate(&pool).await?;
    Ok(pool)
}

fn is_duplicate_database(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P04"),
        _ => false,
    }
}

/// Create the event and snapshot tables with their indices.
pub async fn migrate(pool: &PgPool) -> Result<(), ConnectionError> {
    let statements = [
        r"CREATE TABLE IF NOT EXISTS task_events (
            event_id BIGSERIAL PRIMARY KEY,
            event_type TEXT NOT NULL,
            event_ts TIMESTAMPTZ NOT NULL,
            task_id TEXT,
            event_data JSONB NOT NULL,
            world_seed TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events (task_id)",
        "CREATE INDEX IF NOT EXISTS idx_task_events_ts ON task_events (event_ts DESC)",
        "CREATE INDEX IF NOT EXISTS idx_task_events_type_ts ON task_events (event_type, event_ts DESC)",
        r"CREATE TABLE IF NOT EXISTS task_snapshots (
            task_id TEXT PRIMARY KEY,
            snapshot_ts TIMESTAMPTZ NOT NULL,
            task_data JSONB NOT NULL,
            world_seed TEXT NOT NULL,
            status TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_task_snapshots_status ON task_snapshots (status)",
        "CREATE INDEX IF NOT EXISTS idx_task_snapshots_ts ON task_snapshots (snapshot_ts DESC)",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(ConnectionError::MigrationFailed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_seed() {
        assert_eq!(sanitize_seed("12345"), "12345");
        assert_eq!(sanitize_seed("-987"), "n987");
        assert_eq!(sanitize_seed("seed-42!@#"), "seedn42");
        assert_eq!(sanitize_seed("a_b"), "a_b");
    }

    #[test]
    fn test_seed_database_name() {
        assert_eq!(seed_database_name("-42").unwrap(), "base_seed_n42");
        assert!(seed_database_name("").is_err());
        assert!(seed_database_name("!!!").is_err());
    }
}
