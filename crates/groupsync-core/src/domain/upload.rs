//! Upload queue domain types
//!
//! Locally-originated changes are captured as [`UploadFileTracker`]s. Trackers
//! are first assembled into the *pending* [`UploadQueue`]; submitting a sync
//! moves that batch into the FIFO of *synced* batches, of which only the head
//! is ever in flight.
//!
//! ## Tracker state machine
//!
//! ```text
//!     ┌────────────┐   start    ┌───────────┐   result   ┌──────────┐
//!     │ NotStarted │ ─────────► │ Uploading │ ─────────► │ Uploaded │
//!     └────────────┘            └───────────┘            └──────────┘
//!           ▲                        │
//!           └──── crash recovery ────┘  (no cached result)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{
    AppMetaDataVersion, FileGroupUuid, FileUuid, FileVersion, GoneReason, MasterVersion,
    QueueId, SharingGroupId, TrackerId,
};

/// The kind of change an upload tracker carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOperation {
    /// File content (optionally with application metadata)
    Content,
    /// Application metadata only
    AppMetaData,
    /// Deletion of the file
    Deletion,
}

impl fmt::Display for UploadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadOperation::Content => "content",
            UploadOperation::AppMetaData => "app_meta_data",
            UploadOperation::Deletion => "deletion",
        };
        write!(f, "{}", s)
    }
}

/// Transmission status of an upload tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[default]
    NotStarted,
    Uploading,
    Uploaded,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::NotStarted => "not_started",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
        };
        write!(f, "{}", s)
    }
}

/// A single queued local operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileTracker {
    id: TrackerId,
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub operation: UploadOperation,
    status: UploadStatus,
    /// Local file holding the content (content uploads only)
    pub local_path: Option<PathBuf>,
    pub mime_type: Option<String>,
    pub file_group_uuid: Option<FileGroupUuid>,
    /// Target content version (content uploads only)
    pub file_version: Option<FileVersion>,
    /// Application metadata carried by this tracker
    pub app_meta_data: Option<String>,
    /// Target metadata version when `app_meta_data` is set
    pub app_meta_data_version: Option<AppMetaDataVersion>,
    /// Content upload that restores a file deleted on the server
    pub undelete: bool,
    /// Terminal server failure for this tracker
    pub gone_reason: Option<GoneReason>,
}

impl UploadFileTracker {
    /// Creates a content upload tracker
    pub fn content(
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
        local_path: PathBuf,
        mime_type: Option<String>,
        file_version: FileVersion,
    ) -> Self {
        Self {
            local_path: Some(local_path),
            mime_type,
            file_version: Some(file_version),
            ..Self::base(file_uuid, sharing_group_id, UploadOperation::Content)
        }
    }

    /// Creates a metadata-only upload tracker
    pub fn app_meta_data(
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
        contents: String,
        version: AppMetaDataVersion,
    ) -> Self {
        Self {
            app_meta_data: Some(contents),
            app_meta_data_version: Some(version),
            ..Self::base(file_uuid, sharing_group_id, UploadOperation::AppMetaData)
        }
    }

    /// Creates a deletion tracker
    pub fn deletion(file_uuid: FileUuid, sharing_group_id: SharingGroupId) -> Self {
        Self::base(file_uuid, sharing_group_id, UploadOperation::Deletion)
    }

    fn base(
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
        operation: UploadOperation,
    ) -> Self {
        Self {
            id: TrackerId::new(),
            file_uuid,
            sharing_group_id,
            operation,
            status: UploadStatus::NotStarted,
            local_path: None,
            mime_type: None,
            file_group_uuid: None,
            file_version: None,
            app_meta_data: None,
            app_meta_data_version: None,
            undelete: false,
            gone_reason: None,
        }
    }

    pub fn id(&self) -> &TrackerId {
        &self.id
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// Returns true until the tracker's network operation has completed
    pub fn is_outstanding(&self) -> bool {
        self.status != UploadStatus::Uploaded
    }

    pub fn carries_content(&self) -> bool {
        self.operation == UploadOperation::Content
    }

    pub fn carries_app_meta_data(&self) -> bool {
        self.app_meta_data.is_some()
    }

    pub fn is_deletion(&self) -> bool {
        self.operation == UploadOperation::Deletion
    }

    // --- State transitions ---

    /// NotStarted -> Uploading
    pub fn start(&mut self) -> Result<(), DomainError> {
        match self.status {
            UploadStatus::NotStarted => {
                self.status = UploadStatus::Uploading;
                Ok(())
            }
            other => Err(invalid(other, UploadStatus::Uploading)),
        }
    }

    /// NotStarted | Uploading -> Uploaded
    pub fn complete(&mut self) -> Result<(), DomainError> {
        match self.status {
            UploadStatus::NotStarted | UploadStatus::Uploading => {
                self.status = UploadStatus::Uploaded;
                Ok(())
            }
            other => Err(invalid(other, UploadStatus::Uploaded)),
        }
    }

    /// Uploading -> NotStarted, used when recovery finds no cached result
    pub fn reset(&mut self) -> Result<(), DomainError> {
        match self.status {
            UploadStatus::Uploading => {
                self.status = UploadStatus::NotStarted;
                Ok(())
            }
            other => Err(invalid(other, UploadStatus::NotStarted)),
        }
    }

    /// Moves the content target forward so it supersedes a remote version
    ///
    /// A tracker that was already sent at the old version must be sent again.
    pub fn retarget_file_version(&mut self, version: FileVersion) {
        if self.carries_content() && self.file_version.map_or(true, |v| v < version) {
            self.file_version = Some(version);
            self.status = UploadStatus::NotStarted;
        }
    }

    /// Moves the metadata target forward so it supersedes a remote version
    pub fn retarget_app_meta_data_version(&mut self, version: AppMetaDataVersion) {
        if self.carries_app_meta_data() && self.app_meta_data_version.map_or(true, |v| v < version) {
            self.app_meta_data_version = Some(version);
            self.status = UploadStatus::NotStarted;
        }
    }
}

fn invalid(from: UploadStatus, to: UploadStatus) -> DomainError {
    DomainError::InvalidState {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// A batch of upload trackers for one sharing group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueue {
    id: QueueId,
    sharing_group_id: SharingGroupId,
    pub trackers: Vec<UploadFileTracker>,
    /// Master version carried by a `DoneUploads` call whose answer was not yet committed
    #[serde(default)]
    done_uploads_sent: Option<MasterVersion>,
}

impl UploadQueue {
    pub fn new(sharing_group_id: SharingGroupId) -> Self {
        Self::with_id(QueueId::new(), sharing_group_id)
    }

    /// Reconstitutes a batch with a known identifier
    pub fn with_id(id: QueueId, sharing_group_id: SharingGroupId) -> Self {
        Self {
            id,
            sharing_group_id,
            trackers: Vec::new(),
            done_uploads_sent: None,
        }
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn sharing_group_id(&self) -> &SharingGroupId {
        &self.sharing_group_id
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Returns true once every tracker has been transmitted
    pub fn is_fully_uploaded(&self) -> bool {
        self.trackers.iter().all(|t| !t.is_outstanding())
    }

    pub fn done_uploads_sent(&self) -> Option<MasterVersion> {
        self.done_uploads_sent
    }

    /// Records that `DoneUploads` is about to be sent with `master_version`
    ///
    /// Only a fully uploaded batch can be finished.
    pub fn mark_done_uploads_sent(&mut self, master_version: MasterVersion) -> Result<(), DomainError> {
        if !self.is_fully_uploaded() {
            return Err(DomainError::InvariantViolated(format!(
                "batch {} still has outstanding trackers",
                self.id
            )));
        }
        self.done_uploads_sent = Some(master_version);
        Ok(())
    }

    pub fn clear_done_uploads_sent(&mut self) {
        self.done_uploads_sent = None;
    }

    /// Restores a persisted marker without re-checking the trackers
    pub fn restore_done_uploads_sent(&mut self, master_version: Option<MasterVersion>) {
        self.done_uploads_sent = master_version;
    }

    /// Returns the trackers of this batch for one file
    pub fn for_file<'a>(
        &'a self,
        file_uuid: &'a FileUuid,
    ) -> impl Iterator<Item = &'a UploadFileTracker> + 'a {
        self.trackers.iter().filter(move |t| &t.file_uuid == file_uuid)
    }

    pub fn content_count(&self) -> usize {
        self.trackers.iter().filter(|t| !t.is_deletion()).count()
    }

    pub fn deletion_count(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_deletion()).count()
    }
}

/// The pending batch being assembled plus the FIFO of submitted batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadQueues {
    pub pending: Option<UploadQueue>,
    pub synced: VecDeque<UploadQueue>,
}

impl UploadQueues {
    /// Iterates over every batch, pending first
    pub fn all(&self) -> impl Iterator<Item = &UploadQueue> {
        self.pending.iter().chain(self.synced.iter())
    }

    /// Every tracker for a file across all batches, whatever its status
    pub fn for_file<'a>(
        &'a self,
        file_uuid: &'a FileUuid,
    ) -> impl Iterator<Item = &'a UploadFileTracker> + 'a {
        self.all().flat_map(move |q| q.for_file(file_uuid))
    }

    /// Every tracker for a file across all batches, mutably
    pub fn for_file_mut<'a>(
        &'a mut self,
        file_uuid: &'a FileUuid,
    ) -> impl Iterator<Item = &'a mut UploadFileTracker> + 'a {
        self.pending
            .iter_mut()
            .chain(self.synced.iter_mut())
            .flat_map(|q| q.trackers.iter_mut())
            .filter(move |t| &t.file_uuid == file_uuid)
    }

    /// Removes every tracker matching `pred` from all batches
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<UploadFileTracker>
    where
        F: FnMut(&UploadFileTracker) -> bool,
    {
        let mut removed = Vec::new();
        for queue in self.pending.iter_mut().chain(self.synced.iter_mut()) {
            let (gone, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut queue.trackers).into_iter().partition(|t| pred(t));
            queue.trackers = kept;
            removed.extend(gone);
        }
        removed
    }

    /// Finds a tracker by identifier in any batch
    pub fn tracker_mut(&mut self, id: &TrackerId) -> Option<&mut UploadFileTracker> {
        self.pending
            .iter_mut()
            .chain(self.synced.iter_mut())
            .flat_map(|q| q.trackers.iter_mut())
            .find(|t| t.id() == id)
    }

    /// Finds a tracker by identifier in any batch
    pub fn tracker(&self, id: &TrackerId) -> Option<&UploadFileTracker> {
        self.all().flat_map(|q| q.trackers.iter()).find(|t| t.id() == id)
    }

    /// Total number of outstanding trackers in all batches
    pub fn outstanding_count(&self) -> usize {
        self.all()
            .flat_map(|q| q.trackers.iter())
            .filter(|t| t.is_outstanding())
            .count()
    }
}

/// Attributes reported to the collaborator when a single upload completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileAttributes {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub operation: UploadOperation,
    pub file_version: Option<FileVersion>,
    pub app_meta_data_version: Option<AppMetaDataVersion>,
    pub mime_type: Option<String>,
    pub gone_reason: Option<GoneReason>,
}

impl From<&UploadFileTracker> for UploadFileAttributes {
    fn from(tracker: &UploadFileTracker) -> Self {
        Self {
            file_uuid: tracker.file_uuid,
            sharing_group_id: tracker.sharing_group_id,
            operation: tracker.operation,
            file_version: tracker.file_version,
            app_meta_data_version: tracker.app_meta_data_version,
            mime_type: tracker.mime_type.clone(),
            gone_reason: tracker.gone_reason,
        }
    }
}
