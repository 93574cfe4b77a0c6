//! Remote change discovery and download group delivery
//!
//! The server index is compared against the local directory. Every file
//! that changed remotely becomes a [`DownloadFileTracker`]; trackers sharing
//! a file group form one [`DownloadContentGroup`](groupsync_core::domain::DownloadContentGroup)
//! that is handed to the collaborator only once every member is fetched.
//!
//! Groups remember the master version they were discovered at. If the
//! server has moved on when the next check runs, the groups are stale and
//! the caller discards them and scans again.

use tracing::{debug, info};

use groupsync_core::domain::{
    DownloadFileTracker, DownloadGroupId, DownloadKind, DownloadStatus, MasterVersion,
    SharingGroupId, SyncState, TrackerId,
};
use groupsync_core::ports::{DeliveredFile, DeliveredGroup, FileIndex, IServerApi};

use crate::transfer::download_key;
use crate::SyncError;

/// Result of comparing the server index with local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCheck {
    NoChanges,
    /// Download groups exist for the sharing group; counts are trackers
    ChangesAvailable { content: usize, deletions: usize },
    /// Existing download groups were discovered at an older master version
    MasterVersionConflict(MasterVersion),
}

/// Builds and drains download groups for one sharing group at a time
pub struct DownloadScanner;

impl DownloadScanner {
    /// Fetches the index for a sharing group and plans downloads from it
    ///
    /// # Errors
    /// `SharingGroupRemoved` if the server no longer lists the group,
    /// `Server` on transport failure.
    pub async fn check_for_changes(
        server: &dyn IServerApi,
        state: &mut SyncState,
        sharing_group_id: &SharingGroupId,
    ) -> Result<ChangeCheck, SyncError> {
        let index = server
            .file_index(Some(sharing_group_id))
            .await
            .map_err(SyncError::Server)?;
        Self::plan(state, sharing_group_id, &index)
    }

    /// Plans downloads from an index snapshot
    pub fn plan(
        state: &mut SyncState,
        sharing_group_id: &SharingGroupId,
        index: &FileIndex,
    ) -> Result<ChangeCheck, SyncError> {
        let listed_deleted = index
            .sharing_groups
            .iter()
            .any(|g| &g.sharing_group_id == sharing_group_id && g.deleted);
        let Some(server_mv) = index.master_version.filter(|_| !listed_deleted) else {
            return Err(SyncError::SharingGroupRemoved(*sharing_group_id));
        };

        let known = state
            .download_groups
            .in_sharing_group(sharing_group_id)
            .next()
            .map(|g| g.master_version());
        if let Some(known) = known {
            if known != server_mv {
                info!(
                    sharing_group = %sharing_group_id,
                    known = known.value(),
                    server = server_mv.value(),
                    "Download groups are stale"
                );
                return Ok(ChangeCheck::MasterVersionConflict(server_mv));
            }
            return Ok(Self::counts(state, sharing_group_id));
        }

        for remote in index.files.iter().filter(|f| &f.sharing_group_id == sharing_group_id) {
            let entry = state.directory.get(&remote.file_uuid);
            if remote.gone_reason.is_some() && entry.and_then(|e| e.gone_reason()) == remote.gone_reason {
                continue;
            }

            let kind = if remote.deleted {
                match entry {
                    Some(e) if !e.is_deleted_locally() => DownloadKind::Deletion,
                    _ => continue,
                }
            } else {
                let local_version = entry.and_then(|e| e.file_version());
                let local_meta = entry.and_then(|e| e.app_meta_data_version());
                if local_version < Some(remote.file_version) {
                    DownloadKind::Content
                } else if local_version == Some(remote.file_version)
                    && local_meta < remote.app_meta_data_version
                {
                    DownloadKind::AppMetaDataOnly
                } else {
                    continue;
                }
            };

            let mut tracker =
                DownloadFileTracker::new(remote.file_uuid, *sharing_group_id, kind, remote.file_version);
            tracker.file_group_uuid = remote.file_group_uuid;
            tracker.mime_type = remote.mime_type.clone();
            tracker.app_meta_data_version = remote.app_meta_data_version;
            debug!(
                sharing_group = %sharing_group_id,
                file_uuid = %remote.file_uuid,
                kind = %kind,
                version = remote.file_version,
                "Remote change discovered"
            );
            state.download_groups.add(tracker, server_mv)?;
        }

        if let Some(group) = state.sharing_group_mut(sharing_group_id) {
            group.set_master_version(server_mv);
        }

        let check = Self::counts(state, sharing_group_id);
        if let ChangeCheck::ChangesAvailable { content, deletions } = check {
            info!(
                sharing_group = %sharing_group_id,
                master_version = server_mv.value(),
                content,
                deletions,
                "Remote changes available"
            );
        }
        Ok(check)
    }

    fn counts(state: &SyncState, sharing_group_id: &SharingGroupId) -> ChangeCheck {
        let (mut content, mut deletions) = (0, 0);
        for t in state
            .download_groups
            .trackers()
            .iter()
            .filter(|t| &t.sharing_group_id == sharing_group_id)
        {
            match t.kind {
                DownloadKind::Deletion => deletions += 1,
                _ => content += 1,
            }
        }
        if content + deletions == 0 {
            ChangeCheck::NoChanges
        } else {
            ChangeCheck::ChangesAvailable { content, deletions }
        }
    }

    /// Drops every download group and decision of a sharing group
    pub fn discard(state: &mut SyncState, sharing_group_id: &SharingGroupId) {
        let keys: Vec<_> = state
            .download_groups
            .trackers()
            .iter()
            .filter(|t| &t.sharing_group_id == sharing_group_id)
            .map(download_key)
            .collect();
        for key in &keys {
            state.network_cache.remove(key);
        }
        state.download_groups.clear_sharing_group(sharing_group_id);
        state
            .decisions
            .retain(|d| d.sharing_group_id() != sharing_group_id);
    }

    /// Picks the next tracker to fetch
    ///
    /// Trackers of files under an open decision are held back.
    ///
    /// # Errors
    /// `DownloadAlreadyInProgress` while another tracker is being fetched.
    pub fn next(state: &SyncState, sharing_group_id: &SharingGroupId) -> Result<Option<TrackerId>, SyncError> {
        if state.download_groups.any_downloading() {
            return Err(SyncError::DownloadAlreadyInProgress);
        }
        Ok(state
            .download_groups
            .trackers()
            .iter()
            .find(|t| {
                &t.sharing_group_id == sharing_group_id
                    && t.status() == DownloadStatus::NotStarted
                    && !state.has_decision_for_file(&t.file_uuid)
            })
            .map(|t| *t.id()))
    }

    /// Groups of a sharing group that can be delivered now
    pub fn ready_groups(state: &SyncState, sharing_group_id: &SharingGroupId) -> Vec<DownloadGroupId> {
        state
            .download_groups
            .in_sharing_group(sharing_group_id)
            .map(|g| *g.id())
            .filter(|id| state.download_groups.is_complete(id) && state.decisions_for_group(id).next().is_none())
            .collect()
    }

    /// Applies a completed, undisputed group to the directory and removes it
    ///
    /// Returns `None` if the group is unknown, incomplete, or still held
    /// back by a decision.
    pub fn deliver(state: &mut SyncState, group_id: &DownloadGroupId) -> Result<Option<DeliveredGroup>, SyncError> {
        let Some(group) = state.download_groups.group(group_id).cloned() else {
            return Ok(None);
        };
        if !state.download_groups.is_complete(group_id) || state.decisions_for_group(group_id).next().is_some() {
            return Ok(None);
        }

        let members = state.download_groups.remove_group(group_id);
        for tracker in &members {
            let entry = state
                .directory
                .entry_or_insert(tracker.file_uuid, tracker.sharing_group_id)?;
            if let Some(reason) = tracker.gone_reason {
                entry.set_gone_reason(Some(reason));
            } else {
                match tracker.kind {
                    DownloadKind::Content => {
                        entry.record_file_group(tracker.file_group_uuid)?;
                        entry.record_mime_type(tracker.mime_type.as_deref());
                        entry.commit_file_version(tracker.file_version);
                        entry.clear_deleted_locally();
                        entry.set_gone_reason(None);
                    }
                    DownloadKind::AppMetaDataOnly => {}
                    DownloadKind::Deletion => entry.mark_deleted_locally(),
                }
                match (&tracker.app_meta_data, tracker.app_meta_data_version) {
                    (Some(contents), Some(version)) => entry.commit_app_meta_data(contents.clone(), version),
                    (None, Some(version)) if tracker.kind == DownloadKind::Content => {
                        entry.commit_app_meta_data_version(version)
                    }
                    _ => {}
                }
            }
            state.network_cache.remove(&download_key(tracker));
        }

        info!(
            sharing_group = %group.sharing_group_id(),
            download_group = %group_id,
            files = members.len(),
            "Download group delivered"
        );
        Ok(Some(DeliveredGroup {
            group_id: *group_id,
            sharing_group_id: *group.sharing_group_id(),
            file_group_uuid: group.file_group_uuid().copied(),
            files: members.iter().map(DeliveredFile::from).collect(),
        }))
    }
}
