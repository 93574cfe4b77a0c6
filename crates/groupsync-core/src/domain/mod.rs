//! Domain entities and business logic
//!
//! This module contains the core domain types for group sync:
//! - Newtypes for type-safe identifiers and version counters
//! - Sharing groups and the local directory of synced files
//! - Upload queues and trackers
//! - Download trackers and content groups
//! - The network result cache used for crash-safe replay
//! - Conflict decisions and resolutions
//! - The aggregate state and its transaction wrapper
//! - Domain-specific error types

pub mod conflict;
pub mod directory;
pub mod download;
pub mod errors;
pub mod network_cache;
pub mod newtypes;
pub mod sharing_group;
pub mod state;
pub mod upload;

// Re-export commonly used types
pub use conflict::{
    ConflictResolution, ConflictingClientOperation, ContentDownloadConflict,
    ContentDownloadResolution, ContentUploadKind, DecisionKind, DeletionRejection,
    DownloadDeletionConflict, DownloadDeletionResolution, FileConflict, PendingDecision,
    ResolutionSource, UploadResolution,
};
pub use directory::{Directory, DirectoryEntry};
pub use download::{
    DownloadContentGroup, DownloadFileTracker, DownloadGroups, DownloadKind, DownloadStatus,
};
pub use errors::DomainError;
pub use network_cache::{CachedOutcome, Direction, NetworkResult, NetworkResultCache, OperationKey, OperationKind};
pub use newtypes::*;
pub use sharing_group::SharingGroup;
pub use state::{StateTransaction, SyncState};
pub use upload::{
    UploadFileAttributes, UploadFileTracker, UploadOperation, UploadQueue, UploadQueues,
    UploadStatus,
};
