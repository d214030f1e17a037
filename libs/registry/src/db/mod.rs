//! Postgres-backed registry.
//!
//! This module provides:
//! - Connection pool management
//! - Controller instance storage with an append-only event log for watches
//! - API server leases with database-side expiry
//! - Bootstrap endpoints storage
//!
//! All writes that produce watch events serialize on one advisory lock, so
//! event ids become visible in commit order and cursor tailing never skips.

mod endpoints;
mod instances;
mod leases;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::error::{RegistryError, RegistryResult};

/// Advisory lock key serializing registry writes.
const WRITE_LOCK_KEY: i64 = 0x5C_F0_0001;

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

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// Run schema migrations on connect.
    pub run_migrations: bool,

    /// How long a watcher sleeps when no events are available.
    pub watch_poll_interval: Duration,

    /// Number of recent events kept for watch resumption.
    pub retained_events: i64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/scf".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            run_migrations: false,
            watch_poll_interval: Duration::from_millis(100),
            retained_events: 10_000,
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/scf".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let run_migrations = std::env::var("SCF_RUN_MIGRATIONS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            database_url,
            max_connections,
            min_connections,
            run_migrations,
            ..Default::default()
        }
    }
}

/// Registry backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
    watch_poll_interval: Duration,
    retained_events: i64,
}

impl PgRegistry {
    /// Connect, and run migrations if configured.
    pub async fn connect(config: &DbConfig) -> RegistryResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to registry database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await?;

        info!("Registry connection pool established");

        let registry = Self::from_pool(pool, config);
        if config.run_migrations {
            registry.run_migrations().await?;
        }
        Ok(registry)
    }

    pub fn from_pool(pool: PgPool, config: &DbConfig) -> Self {
        Self {
            pool,
            watch_poll_interval: config.watch_poll_interval,
            retained_events: config.retained_events.max(1),
        }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> RegistryResult<()> {
        info!("Running registry migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("libs/registry/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await?;
                    info!("Registry migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(RegistryError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Begin a write transaction holding the registry write lock.
    async fn begin_write(&self) -> RegistryResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(WRITE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

/// Take the next global revision.
async fn next_revision(tx: &mut Transaction<'_, Postgres>) -> RegistryResult<i64> {
    let revision: i64 = sqlx::query_scalar("SELECT nextval('registry_revision')")
        .fetch_one(&mut **tx)
        .await?;
    Ok(revision)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(!config.run_migrations);
        assert_eq!(config.watch_poll_interval, Duration::from_millis(100));
    }
}
