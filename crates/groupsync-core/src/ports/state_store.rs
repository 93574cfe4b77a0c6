//! State store port (driven/secondary port)
//!
//! This module defines the interface for persisting the engine's
//! [`SyncState`].
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, filesystem, etc.) and don't need domain-level classification.
//! - `save` must be atomic: either the whole state is written or none of
//!   it is. The engine only calls it through
//!   [`StateTransaction::commit`](crate::domain::state::StateTransaction::commit),
//!   after the cross-entity invariants have been checked.

use crate::domain::state::SyncState;

/// Port trait for persistent sync state
#[async_trait::async_trait]
pub trait IStateStore: Send + Sync {
    /// Loads the last committed state (empty if nothing was saved yet)
    async fn load(&self) -> anyhow::Result<SyncState>;

    /// Atomically replaces the persisted state
    async fn save(&self, state: &SyncState) -> anyhow::Result<()>;
}
