//! groupsync Sync - Queues, transfers and the per-sharing-group sync pass
//!
//! Provides:
//! - The two-stage upload queue (pending batch, synced FIFO)
//! - Remote change discovery grouped into download content groups
//! - Cache-backed transfers that replay completed calls after a crash
//! - The orchestrator driving upload and download phases under the
//!   master-version protocol
//!
//! ## Modules
//!
//! - [`upload_queue`] - Enqueue validation, replacement rules, batch commit
//! - [`download`] - Change checks against the server index, group delivery
//! - [`transfer`] - Network calls for single trackers and crash reconciliation
//! - [`orchestrator`] - The sync state machine and the public operations
//! - [`scheduler`] - Request FIFO and cooperative stop flag shared across tasks

pub mod download;
pub mod orchestrator;
pub mod scheduler;
pub mod transfer;
pub mod upload_queue;

pub use download::{ChangeCheck, DownloadScanner};
pub use orchestrator::{SyncOrchestrator, SyncPhase, SyncSettings};
pub use scheduler::SyncScheduler;
pub use transfer::{ReconcileReport, TransferEngine};
pub use upload_queue::{AppMetaDataUpload, ContentUpload, UploadChange, UploadQueueManager};

use thiserror::Error;

use groupsync_conflict::ConflictError;
use groupsync_core::domain::{DomainError, FileUuid, SharingGroupId, StateTransaction, SyncState};
use groupsync_core::ports::IStateStore;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// The sharing group has never been registered locally
    #[error("unknown sharing group: {0}")]
    UnknownSharingGroup(SharingGroupId),

    /// The user is no longer a member of the sharing group
    #[error("sharing group {0} has been removed")]
    SharingGroupRemoved(SharingGroupId),

    /// Local changes are being assembled for another sharing group
    #[error("uploads for sharing group {queued} are already queued; cannot queue for {requested}")]
    AlreadyQueuedElsewhere {
        queued: SharingGroupId,
        requested: SharingGroupId,
    },

    /// The file is deleted locally or has a deletion queued
    #[error("file {0} is queued for deletion")]
    FileQueuedForDeletion(FileUuid),

    /// Metadata cannot be the first thing uploaded for a file
    #[error("file {0} has no uploaded content; metadata cannot create version 0")]
    CannotVersionZeroViaMetadataUpload(FileUuid),

    /// The mime type of a file is fixed by its first content upload
    #[error("mime type of file {file} is {expected}, not {actual}")]
    MimeTypeMismatch {
        file: FileUuid,
        expected: String,
        actual: String,
    },

    /// An upload did not target the next version of the file
    #[error("file {file}: expected version {expected}, got {actual}")]
    NonConsecutiveVersion {
        file: FileUuid,
        expected: u64,
        actual: u64,
    },

    /// `next()` was called while a download is still outstanding
    #[error("a download is already in progress")]
    DownloadAlreadyInProgress,

    /// The head batch still has trackers that were not uploaded
    #[error("batch for sharing group {sharing_group} has {outstanding} outstanding uploads")]
    BatchIncomplete {
        sharing_group: SharingGroupId,
        outstanding: usize,
    },

    /// The server kept reporting a newer master version
    #[error("sharing group {sharing_group}: master version conflict persisted after {retries} retries")]
    MasterVersionRetriesExhausted {
        sharing_group: SharingGroupId,
        retries: u32,
    },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Transport or server failure; the pass halts and can be resumed
    #[error("server error: {0:#}")]
    Server(anyhow::Error),

    /// The state store failed to load or commit
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Commits a transaction, adopting the stored state on success
pub(crate) async fn commit(
    tx: StateTransaction,
    store: &dyn IStateStore,
) -> Result<SyncState, SyncError> {
    tx.commit(store).await.map_err(SyncError::Storage)
}
