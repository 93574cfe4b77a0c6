//! groupsync Cache - Local state persistence
//!
//! SQLite-based storage for:
//! - Sharing groups and the directory of synced files
//! - Pending and synced upload batches
//! - Download content groups and their trackers
//! - The network result cache used for crash recovery
//! - Pending conflict decisions and queued sync requests
//!
//! ## Architecture
//!
//! This crate implements the `IStateStore` port from `groupsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Single-writer connection with schema migration
//! - [`SqliteStateStore`] - `IStateStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use groupsync_cache::DatabasePool;
//! use groupsync_core::config::Config;
//! use groupsync_core::ports::IStateStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load_or_default(&Config::default_path());
//! let pool = DatabasePool::from_config(&config).await?;
//! let store = pool.state_store();
//! let state = store.load().await?;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::{DatabasePool, SCHEMA_VERSION};
pub use store::SqliteStateStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
