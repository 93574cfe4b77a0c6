//! Conflict resolution executor
//!
//! Applies an answer to a pending decision on a working copy of the state:
//! - accepting a remote change discards the colliding local trackers and
//!   leaves the download tracker to be delivered normally
//! - rejecting it keeps the chosen local trackers, re-targets them past the
//!   remote version and drops the download tracker, recording the remote
//!   version in the directory so the next upload supersedes it

use tracing::{debug, info};

use groupsync_core::domain::{
    ConflictResolution, ContentDownloadConflict, ContentDownloadResolution, DecisionId,
    DecisionKind, DeletionRejection, DownloadDeletionConflict, DownloadDeletionResolution,
    DownloadGroupId, DownloadKind, FileUuid, PendingDecision, ResolutionSource, SyncState,
    UploadOperation,
};

use crate::error::ConflictError;

/// Applies conflict resolutions to the sync state
pub struct ConflictResolver;

impl ConflictResolver {
    /// Answers a pending decision and removes it
    ///
    /// Returns the download group the decision was holding back, so the
    /// caller can deliver it once no other decision blocks it.
    ///
    /// # Errors
    /// - `ConflictError::NotFound` if no such decision is pending
    /// - `ConflictError::ResolutionKindMismatch` if the answer is for the
    ///   other kind of conflict
    /// - `ConflictError::CannotUndeleteWithAppMetaDataOnly` when keeping a
    ///   metadata-only upload against a remote deletion
    ///
    /// The state is left untouched when an error is returned.
    pub fn resolve(
        state: &mut SyncState,
        decision_id: &DecisionId,
        resolution: ConflictResolution,
        source: ResolutionSource,
    ) -> Result<DownloadGroupId, ConflictError> {
        let decision = state
            .decision(decision_id)
            .cloned()
            .ok_or_else(|| ConflictError::NotFound(decision_id.to_string()))?;

        match (decision.kind(), resolution) {
            (DecisionKind::DownloadDeletion(conflict), ConflictResolution::DownloadDeletion(r)) => {
                Self::apply_deletion(state, &decision, conflict, r)?;
            }
            (DecisionKind::ContentDownload(conflict), ConflictResolution::ContentDownload(r)) => {
                Self::apply_content(state, &decision, conflict, r)?;
            }
            _ => return Err(ConflictError::ResolutionKindMismatch(decision_id.to_string())),
        }

        state.decisions.retain(|d| d.id() != decision_id);

        info!(
            decision = %decision_id,
            sharing_group = %decision.sharing_group_id(),
            ?resolution,
            source = %source,
            "Conflict resolved"
        );
        Ok(*decision.group_id())
    }

    fn apply_deletion(
        state: &mut SyncState,
        decision: &PendingDecision,
        conflict: &DownloadDeletionConflict,
        resolution: DownloadDeletionResolution,
    ) -> Result<(), ConflictError> {
        let keep_content = resolution
            == DownloadDeletionResolution::RejectDownloadDeletion(DeletionRejection::KeepContentUpload);

        if keep_content {
            if let Some(bad) = conflict
                .conflicts
                .iter()
                .find(|c| c.operation.is_app_meta_data_only())
            {
                return Err(ConflictError::CannotUndeleteWithAppMetaDataOnly {
                    file: bad.file_uuid.to_string(),
                });
            }
        }

        for file in conflict.conflicts.iter().map(|c| c.file_uuid) {
            if !keep_content {
                let removed = state.upload_queues.remove_where(|t| t.file_uuid == file);
                debug!(file_uuid = %file, removed = removed.len(), "Dropped local uploads for remote deletion");
                continue;
            }

            let Some(remote_version) = Self::take_download(state, decision.group_id(), &file) else {
                continue;
            };
            // the kept content revives the file, so a local deletion is moot
            if !state
                .upload_queues
                .remove_where(|t| t.file_uuid == file && t.is_deletion())
                .is_empty()
            {
                if let Some(entry) = state.directory.get_mut(&file) {
                    entry.clear_deleted_locally();
                }
            }
            for tracker in state.upload_queues.for_file_mut(&file) {
                if tracker.carries_content() {
                    tracker.undelete = true;
                    tracker.retarget_file_version(remote_version + 1);
                }
            }
            Self::record_remote_versions(state, decision, &file, Some(remote_version), None)?;
            debug!(file_uuid = %file, "Remote deletion rejected, content will be re-uploaded");
        }
        Ok(())
    }

    fn apply_content(
        state: &mut SyncState,
        decision: &PendingDecision,
        conflict: &ContentDownloadConflict,
        resolution: ContentDownloadResolution,
    ) -> Result<(), ConflictError> {
        let file = conflict.file_uuid;

        let removed = match resolution {
            ContentDownloadResolution::AcceptContentDownload => {
                state.upload_queues.remove_where(|t| t.file_uuid == file)
            }
            ContentDownloadResolution::RejectContentDownload(keep) => {
                state.upload_queues.remove_where(|t| {
                    t.file_uuid == file
                        && match t.operation {
                            UploadOperation::Deletion => !keep.keeps_upload_deletions(),
                            _ => !keep.keeps_content_uploads(),
                        }
                })
            }
        };

        if removed.iter().any(|t| t.is_deletion()) {
            if let Some(entry) = state.directory.get_mut(&file) {
                entry.clear_deleted_locally();
            }
        }

        if let ContentDownloadResolution::RejectContentDownload(_) = resolution {
            Self::take_download(state, decision.group_id(), &file);

            let remote_file_version = match conflict.download_kind {
                DownloadKind::Content => Some(conflict.remote_file_version),
                _ => None,
            };
            for tracker in state.upload_queues.for_file_mut(&file) {
                if let Some(v) = remote_file_version {
                    tracker.retarget_file_version(v + 1);
                }
                if let Some(v) = conflict.remote_app_meta_data_version {
                    tracker.retarget_app_meta_data_version(v + 1);
                }
            }
            Self::record_remote_versions(
                state,
                decision,
                &file,
                remote_file_version,
                conflict.remote_app_meta_data_version,
            )?;
        }
        Ok(())
    }

    /// Removes the file's download tracker from the group, returning its version
    fn take_download(state: &mut SyncState, group_id: &DownloadGroupId, file: &FileUuid) -> Option<u64> {
        let id = state
            .download_groups
            .members(group_id)
            .find(|t| &t.file_uuid == file)
            .map(|t| *t.id())?;
        state
            .download_groups
            .remove_tracker(&id)
            .map(|t| t.file_version)
    }

    /// Records rejected remote versions without delivering their content
    fn record_remote_versions(
        state: &mut SyncState,
        decision: &PendingDecision,
        file: &FileUuid,
        file_version: Option<u64>,
        app_meta_data_version: Option<u64>,
    ) -> Result<(), ConflictError> {
        let entry = state
            .directory
            .entry_or_insert(*file, *decision.sharing_group_id())?;
        if let Some(v) = file_version {
            if entry.file_version().map_or(true, |current| current < v) {
                entry.commit_file_version(v);
            }
        }
        if let Some(v) = app_meta_data_version {
            if entry.app_meta_data_version().map_or(true, |current| current < v) {
                entry.commit_app_meta_data_version(v);
            }
        }
        Ok(())
    }
}
