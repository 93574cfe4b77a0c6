//! Sync delegate port (driving side callbacks)
//!
//! The embedding application implements [`ISyncDelegate`] to observe a sync
//! pass and to answer conflict decisions. Every method has a no-op default so
//! implementors only override what they care about.
//!
//! ## Design Notes
//!
//! - Callbacks are invoked from the orchestrator's serialized context and
//!   must not call back into the orchestrator.
//! - The two `must_resolve_*` methods are decision points. Returning `Some`
//!   answers the conflict before the pass continues; returning `None` leaves
//!   the decision pending until it is answered through
//!   `SyncOrchestrator::resolve_conflict`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::conflict::{
    ContentDownloadConflict, ContentDownloadResolution, DownloadDeletionConflict,
    DownloadDeletionResolution, PendingDecision,
};
use crate::domain::download::{DownloadFileTracker, DownloadKind};
use crate::domain::newtypes::{
    AppMetaDataVersion, DownloadGroupId, FileGroupUuid, FileUuid, FileVersion, GoneReason,
    SharingGroupId,
};
use crate::domain::upload::UploadFileAttributes;

/// One member of a delivered download group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredFile {
    pub file_uuid: FileUuid,
    pub kind: DownloadKind,
    pub file_version: FileVersion,
    pub app_meta_data_version: Option<AppMetaDataVersion>,
    pub mime_type: Option<String>,
    pub local_path: Option<PathBuf>,
    pub app_meta_data: Option<String>,
    pub gone_reason: Option<GoneReason>,
}

impl From<&DownloadFileTracker> for DeliveredFile {
    fn from(t: &DownloadFileTracker) -> Self {
        Self {
            file_uuid: t.file_uuid,
            kind: t.kind,
            file_version: t.file_version,
            app_meta_data_version: t.app_meta_data_version,
            mime_type: t.mime_type.clone(),
            local_path: t.local_path.clone(),
            app_meta_data: t.app_meta_data.clone(),
            gone_reason: t.gone_reason,
        }
    }
}

/// A download group handed to the collaborator once all members are fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredGroup {
    pub group_id: DownloadGroupId,
    pub sharing_group_id: SharingGroupId,
    pub file_group_uuid: Option<FileGroupUuid>,
    pub files: Vec<DeliveredFile>,
}

/// Port trait for sync lifecycle events and conflict decisions
#[allow(unused_variables)]
pub trait ISyncDelegate: Send + Sync {
    fn sync_started(&self, sharing_group_id: &SharingGroupId) {}

    fn will_start_uploads(&self, sharing_group_id: &SharingGroupId, content: usize, deletions: usize) {}

    fn will_start_downloads(&self, sharing_group_id: &SharingGroupId, content: usize) {}

    fn content_uploads_completed(&self, sharing_group_id: &SharingGroupId, count: usize) {}

    fn upload_deletions_completed(&self, sharing_group_id: &SharingGroupId, count: usize) {}

    fn single_file_upload_complete(&self, attributes: &UploadFileAttributes) {}

    /// Fired exactly once per download group
    fn file_group_download_complete(&self, group: &DeliveredGroup) {}

    fn sync_done(&self, sharing_group_id: &SharingGroupId) {}

    fn sync_stopping(&self, sharing_group_id: &SharingGroupId) {}

    /// A sync was requested while another pass was running and has been queued
    fn sync_delayed(&self, sharing_group_id: &SharingGroupId) {}

    fn sync_server_error_occurred(&self, sharing_group_id: Option<&SharingGroupId>, error: &str) {}

    /// A tracker ended with a terminal gone response
    fn file_gone(&self, sharing_group_id: &SharingGroupId, file_uuid: &FileUuid, reason: GoneReason) {}

    fn must_resolve_download_deletion_conflicts(
        &self,
        decision: &PendingDecision,
        conflict: &DownloadDeletionConflict,
    ) -> Option<DownloadDeletionResolution> {
        None
    }

    fn must_resolve_content_download_conflict(
        &self,
        decision: &PendingDecision,
        conflict: &ContentDownloadConflict,
    ) -> Option<ContentDownloadResolution> {
        None
    }
}

/// Delegate that ignores every event and leaves decisions pending
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl ISyncDelegate for NoopDelegate {}
