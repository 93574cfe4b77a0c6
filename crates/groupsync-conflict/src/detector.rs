//! Conflict detection logic
//!
//! Cross-references discovered remote changes against the local work still
//! sitting in the upload queues. Local work counts until it is committed by
//! a successful batch completion, so trackers that were already sent but not
//! yet committed still collide.

use tracing::info;

use groupsync_core::domain::{
    ConflictingClientOperation, ContentDownloadConflict, DecisionKind, DownloadDeletionConflict,
    DownloadKind, FileConflict, FileUuid, PendingDecision, SharingGroupId, SyncState,
    UploadOperation,
};

/// Detects collisions between remote changes and queued local work
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies the queued local work for a file, if any
    pub fn local_operation(state: &SyncState, file_uuid: &FileUuid) -> Option<ConflictingClientOperation> {
        let mut content = false;
        let mut app_meta_data = false;
        let mut deletion = false;

        for tracker in state.upload_queues.for_file(file_uuid) {
            match tracker.operation {
                UploadOperation::Content => {
                    content = true;
                    app_meta_data |= tracker.carries_app_meta_data();
                }
                UploadOperation::AppMetaData => app_meta_data = true,
                UploadOperation::Deletion => deletion = true,
            }
        }

        ConflictingClientOperation::from_flags(content, app_meta_data, deletion)
    }

    /// Records a decision for every new collision in the sharing group's
    /// download groups and returns the decisions created
    ///
    /// Deletions are decided once per download group; content and metadata
    /// changes once per file. Files already covered by a decision are skipped.
    pub fn detect(state: &mut SyncState, sharing_group_id: &SharingGroupId) -> Vec<PendingDecision> {
        let mut created = Vec::new();

        let group_ids: Vec<_> = state
            .download_groups
            .in_sharing_group(sharing_group_id)
            .map(|g| *g.id())
            .collect();

        for group_id in group_ids {
            let mut deletion_conflicts = Vec::new();

            let members: Vec<_> = state.download_groups.members(&group_id).cloned().collect();
            for tracker in members {
                if state.has_decision_for_file(&tracker.file_uuid) {
                    continue;
                }
                let Some(operation) = Self::local_operation(state, &tracker.file_uuid) else {
                    continue;
                };

                match tracker.kind {
                    DownloadKind::Deletion => {
                        // a queued local deletion agrees with the remote one
                        if operation == ConflictingClientOperation::UploadDeletion {
                            continue;
                        }
                        deletion_conflicts.push(FileConflict {
                            file_uuid: tracker.file_uuid,
                            operation,
                        });
                    }
                    DownloadKind::Content | DownloadKind::AppMetaDataOnly => {
                        info!(
                            sharing_group = %sharing_group_id,
                            file_uuid = %tracker.file_uuid,
                            remote_version = tracker.file_version,
                            ?operation,
                            "Content download conflicts with queued local work"
                        );
                        let decision = PendingDecision::new(
                            group_id,
                            *sharing_group_id,
                            DecisionKind::ContentDownload(ContentDownloadConflict {
                                file_uuid: tracker.file_uuid,
                                download_kind: tracker.kind,
                                remote_file_version: tracker.file_version,
                                remote_app_meta_data_version: tracker.app_meta_data_version,
                                operation,
                            }),
                        );
                        state.decisions.push(decision.clone());
                        created.push(decision);
                    }
                }
            }

            if !deletion_conflicts.is_empty() {
                info!(
                    sharing_group = %sharing_group_id,
                    download_group = %group_id,
                    files = deletion_conflicts.len(),
                    "Download deletion conflicts with queued local uploads"
                );
                let decision = PendingDecision::new(
                    group_id,
                    *sharing_group_id,
                    DecisionKind::DownloadDeletion(DownloadDeletionConflict {
                        conflicts: deletion_conflicts,
                    }),
                );
                state.decisions.push(decision.clone());
                created.push(decision);
            }
        }

        created
    }
}
