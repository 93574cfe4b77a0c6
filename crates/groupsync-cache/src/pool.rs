//! State database connection
//!
//! [`SqliteStateStore`] rewrites the whole sync state inside one transaction
//! per commit, so the pool holds exactly one long-lived connection:
//! - commits are serialized without relying on SQLite's busy handler
//! - an in-memory database keeps its contents between commits
//!
//! The store is the crash boundary of the sync engine. A commit that
//! returned must survive power loss before the next network call is made,
//! so file databases run in WAL mode with `synchronous = FULL`.
//!
//! The schema version is kept in `PRAGMA user_version`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use groupsync_core::config::Config;

use crate::store::SqliteStateStore;
use crate::CacheError;

/// Version written by the bundled migration
pub const SCHEMA_VERSION: i64 = 1;

/// The single-writer connection behind a [`SqliteStateStore`]
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens the database named by `sync.state_db`
    pub async fn from_config(config: &Config) -> Result<Self, CacheError> {
        Self::new(&config.sync.state_db).await
    }

    /// Opens (creating if needed) the state database at `db_path`
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if the directory or the database cannot be opened,
    /// `MigrationFailed` if the schema cannot be brought up to date.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = Self::connect(options, &db_path.display().to_string()).await?;
        tracing::info!(path = %db_path.display(), "State database opened");
        Ok(pool)
    }

    /// Opens a private in-memory database, used by tests
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;
        let pool = Self::connect(options, "in-memory database").await?;
        tracing::debug!("In-memory state database initialized");
        Ok(pool)
    }

    async fn connect(options: SqliteConnectOptions, name: &str) -> Result<Self, CacheError> {
        let options = options
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // the connection must never be recycled, or an in-memory database is lost
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("Failed to open {}: {}", name, e)))?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// A state store committing through this connection
    pub fn state_store(&self) -> SqliteStateStore {
        SqliteStateStore::new(self.pool.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The schema version recorded in the database
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        Ok(sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Waits for the connection to finish and closes it
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), CacheError> {
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| CacheError::MigrationFailed(format!("Failed to read schema version: {}", e)))?;

    if current > SCHEMA_VERSION {
        return Err(CacheError::MigrationFailed(format!(
            "database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    if current == SCHEMA_VERSION {
        tracing::debug!(version = current, "State schema up to date");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| CacheError::MigrationFailed(e.to_string()))?;
    sqlx::raw_sql(include_str!("migrations/20261016_initial.sql"))
        .execute(&mut *tx)
        .await
        .map_err(|e| CacheError::MigrationFailed(format!("Failed to run initial migration: {}", e)))?;
    sqlx::raw_sql(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await
        .map_err(|e| CacheError::MigrationFailed(format!("Failed to record schema version: {}", e)))?;
    tx.commit()
        .await
        .map_err(|e| CacheError::MigrationFailed(e.to_string()))?;

    tracing::info!(from = current, to = SCHEMA_VERSION, "State schema migrated");
    Ok(())
}
