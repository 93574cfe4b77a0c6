//! Upload queue manager
//!
//! Local changes are assembled in a *pending* batch for one sharing group.
//! `sync` snapshots that batch into the *synced* FIFO, whose head is the
//! only batch ever in flight. A batch leaves the FIFO when `DoneUploads`
//! succeeds, and only then are its versions written to the directory.
//!
//! ## Replacement rules inside the pending batch
//!
//! | queued first | queued second | result                                        |
//! |--------------|---------------|-----------------------------------------------|
//! | content      | content       | second replaces first (same target version)   |
//! | content      | metadata      | metadata folded into the content tracker      |
//! | metadata     | content       | metadata tracker removed                      |
//! | metadata     | metadata      | second replaces first                         |
//! | deletion     | anything      | `FileQueuedForDeletion`                       |
//! | anything     | deletion      | earlier trackers removed, deletion queued     |
//!
//! A deletion of a file that never reached the server is settled locally:
//! the file is marked deleted and nothing is sent.

use std::path::PathBuf;

use tracing::{debug, info};

use groupsync_core::domain::{
    AppMetaDataVersion, DomainError, FileGroupUuid, FileUuid, FileVersion, MasterVersion,
    SharingGroupId, SyncState, UploadFileTracker, UploadOperation, UploadQueue,
};
use groupsync_core::ports::FileIndex;

use crate::transfer::upload_key;
use crate::SyncError;

// ============================================================================
// Requests
// ============================================================================

/// A content upload requested by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpload {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub local_path: PathBuf,
    pub mime_type: Option<String>,
    pub file_group_uuid: Option<FileGroupUuid>,
    pub app_meta_data: Option<String>,
    /// Target version; derived from the directory and queue when `None`
    pub file_version: Option<FileVersion>,
}

impl ContentUpload {
    pub fn new(
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_uuid,
            sharing_group_id,
            local_path: local_path.into(),
            mime_type: None,
            file_group_uuid: None,
            app_meta_data: None,
            file_version: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_group(mut self, file_group_uuid: FileGroupUuid) -> Self {
        self.file_group_uuid = Some(file_group_uuid);
        self
    }

    pub fn with_app_meta_data(mut self, contents: impl Into<String>) -> Self {
        self.app_meta_data = Some(contents.into());
        self
    }

    pub fn with_version(mut self, version: FileVersion) -> Self {
        self.file_version = Some(version);
        self
    }
}

/// A metadata-only upload requested by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMetaDataUpload {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub contents: String,
    pub version: Option<AppMetaDataVersion>,
}

impl AppMetaDataUpload {
    pub fn new(file_uuid: FileUuid, sharing_group_id: SharingGroupId, contents: impl Into<String>) -> Self {
        Self {
            file_uuid,
            sharing_group_id,
            contents: contents.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: AppMetaDataVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// A local change to queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadChange {
    Content(ContentUpload),
    AppMetaData(AppMetaDataUpload),
    Deletion {
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
    },
}

impl UploadChange {
    pub fn deletion(file_uuid: FileUuid, sharing_group_id: SharingGroupId) -> Self {
        UploadChange::Deletion {
            file_uuid,
            sharing_group_id,
        }
    }

    pub fn file_uuid(&self) -> FileUuid {
        match self {
            UploadChange::Content(u) => u.file_uuid,
            UploadChange::AppMetaData(u) => u.file_uuid,
            UploadChange::Deletion { file_uuid, .. } => *file_uuid,
        }
    }

    pub fn sharing_group_id(&self) -> SharingGroupId {
        match self {
            UploadChange::Content(u) => u.sharing_group_id,
            UploadChange::AppMetaData(u) => u.sharing_group_id,
            UploadChange::Deletion {
                sharing_group_id, ..
            } => *sharing_group_id,
        }
    }
}

impl From<ContentUpload> for UploadChange {
    fn from(upload: ContentUpload) -> Self {
        UploadChange::Content(upload)
    }
}

impl From<AppMetaDataUpload> for UploadChange {
    fn from(upload: AppMetaDataUpload) -> Self {
        UploadChange::AppMetaData(upload)
    }
}

// ============================================================================
// UploadQueueManager
// ============================================================================

/// Owns the rules for the pending batch and the synced FIFO
pub struct UploadQueueManager;

impl UploadQueueManager {
    /// Validates a local change and adds it to the pending batch
    ///
    /// # Errors
    /// - `UnknownSharingGroup` / `SharingGroupRemoved`
    /// - `AlreadyQueuedElsewhere` if the pending batch is for another group
    /// - `FileQueuedForDeletion` if the file is deleted locally
    /// - `CannotVersionZeroViaMetadataUpload`, `MimeTypeMismatch`,
    ///   `NonConsecutiveVersion`, and `DomainError::FileGroupChanged`
    pub fn enqueue(state: &mut SyncState, change: UploadChange) -> Result<(), SyncError> {
        let file = change.file_uuid();
        let sharing_group = change.sharing_group_id();

        Self::check_sharing_group(state, &sharing_group)?;

        if let Some(pending) = &state.upload_queues.pending {
            if pending.sharing_group_id() != &sharing_group {
                return Err(SyncError::AlreadyQueuedElsewhere {
                    queued: *pending.sharing_group_id(),
                    requested: sharing_group,
                });
            }
        }

        if let Some(entry) = state.directory.get(&file) {
            if entry.sharing_group_id() != &sharing_group {
                return Err(DomainError::ValidationFailed(format!(
                    "file {} belongs to sharing group {}",
                    file,
                    entry.sharing_group_id()
                ))
                .into());
            }
            if entry.is_deleted_locally() {
                return Err(SyncError::FileQueuedForDeletion(file));
            }
        }
        if state.upload_queues.for_file(&file).any(|t| t.is_deletion()) {
            return Err(SyncError::FileQueuedForDeletion(file));
        }

        match change {
            UploadChange::Content(upload) => Self::enqueue_content(state, upload),
            UploadChange::AppMetaData(upload) => Self::enqueue_app_meta_data(state, upload),
            UploadChange::Deletion { .. } => Self::enqueue_deletion(state, file, sharing_group),
        }
    }

    /// Fails unless the sharing group is known and not removed
    pub fn check_sharing_group(state: &SyncState, sharing_group_id: &SharingGroupId) -> Result<(), SyncError> {
        match state.sharing_group(sharing_group_id) {
            None => Err(SyncError::UnknownSharingGroup(*sharing_group_id)),
            Some(group) if group.is_removed() => Err(SyncError::SharingGroupRemoved(*sharing_group_id)),
            Some(_) => Ok(()),
        }
    }

    /// The content version the next content upload of `file_uuid` targets
    ///
    /// One past the committed version, or past the newest content already
    /// waiting in a synced batch.
    pub fn next_file_version(state: &SyncState, file_uuid: &FileUuid) -> FileVersion {
        let committed = state
            .directory
            .get(file_uuid)
            .map_or(0, |e| e.next_file_version());
        synced_for_file(state, file_uuid)
            .filter(|t| t.carries_content())
            .filter_map(|t| t.file_version)
            .map(|v| v + 1)
            .fold(committed, u64::max)
    }

    /// The metadata version the next metadata upload of `file_uuid` targets
    pub fn next_app_meta_data_version(state: &SyncState, file_uuid: &FileUuid) -> AppMetaDataVersion {
        let committed = state
            .directory
            .get(file_uuid)
            .map_or(0, |e| e.next_app_meta_data_version());
        synced_for_file(state, file_uuid)
            .filter(|t| t.carries_app_meta_data())
            .filter_map(|t| t.app_meta_data_version)
            .map(|v| v + 1)
            .fold(committed, u64::max)
    }

    fn enqueue_content(state: &mut SyncState, upload: ContentUpload) -> Result<(), SyncError> {
        let file = upload.file_uuid;
        let sharing_group = upload.sharing_group_id;

        if let Some(requested) = upload.mime_type.as_deref() {
            let known = state
                .directory
                .get(&file)
                .and_then(|e| e.mime_type().map(str::to_string))
                .or_else(|| {
                    state
                        .upload_queues
                        .for_file(&file)
                        .find_map(|t| t.mime_type.clone())
                });
            if let Some(expected) = known {
                if expected != requested {
                    return Err(SyncError::MimeTypeMismatch {
                        file,
                        expected,
                        actual: requested.to_string(),
                    });
                }
            }
        }

        let known_group = state
            .directory
            .get(&file)
            .and_then(|e| e.file_group_uuid().copied());
        if let (Some(existing), Some(requested)) = (known_group, upload.file_group_uuid) {
            if existing != requested {
                return Err(DomainError::FileGroupChanged {
                    file: file.to_string(),
                    expected: existing.to_string(),
                    actual: requested.to_string(),
                }
                .into());
            }
        }

        let target = Self::next_file_version(state, &file);
        if let Some(requested) = upload.file_version {
            if requested != target {
                return Err(SyncError::NonConsecutiveVersion {
                    file,
                    expected: target,
                    actual: requested,
                });
            }
        }
        let meta_target = Self::next_app_meta_data_version(state, &file);

        let mut tracker = UploadFileTracker::content(
            file,
            sharing_group,
            upload.local_path,
            upload.mime_type,
            target,
        );
        tracker.file_group_uuid = upload.file_group_uuid;

        let queue = state
            .upload_queues
            .pending
            .get_or_insert_with(|| UploadQueue::new(sharing_group));
        let (previous, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.trackers)
            .into_iter()
            .partition(|t| t.file_uuid == file);
        queue.trackers = kept;

        // a replaced content upload hands over metadata the new one lacks
        let carried = previous
            .iter()
            .filter(|t| t.operation == UploadOperation::Content)
            .find_map(|t| t.app_meta_data.clone().zip(t.app_meta_data_version));
        match (upload.app_meta_data, carried) {
            (Some(contents), _) => {
                tracker.app_meta_data = Some(contents);
                tracker.app_meta_data_version = Some(meta_target);
            }
            (None, Some((contents, version))) => {
                tracker.app_meta_data = Some(contents);
                tracker.app_meta_data_version = Some(version);
            }
            (None, None) => {}
        }
        queue.trackers.push(tracker);

        debug!(
            file_uuid = %file,
            sharing_group = %sharing_group,
            version = target,
            replaced = previous.len(),
            "Queued content upload"
        );
        Ok(())
    }

    fn enqueue_app_meta_data(state: &mut SyncState, upload: AppMetaDataUpload) -> Result<(), SyncError> {
        let file = upload.file_uuid;
        let sharing_group = upload.sharing_group_id;

        let has_content = state.directory.get(&file).map_or(false, |e| e.is_on_server())
            || state.upload_queues.for_file(&file).any(|t| t.carries_content());
        if !has_content {
            return Err(SyncError::CannotVersionZeroViaMetadataUpload(file));
        }

        let target = Self::next_app_meta_data_version(state, &file);
        if let Some(requested) = upload.version {
            if requested != target {
                return Err(SyncError::NonConsecutiveVersion {
                    file,
                    expected: target,
                    actual: requested,
                });
            }
        }

        let queue = state
            .upload_queues
            .pending
            .get_or_insert_with(|| UploadQueue::new(sharing_group));

        if let Some(content) = queue
            .trackers
            .iter_mut()
            .find(|t| t.file_uuid == file && t.carries_content())
        {
            content.app_meta_data = Some(upload.contents);
            content.app_meta_data_version = Some(target);
            debug!(file_uuid = %file, version = target, "Metadata folded into queued content upload");
            return Ok(());
        }

        queue.trackers.retain(|t| t.file_uuid != file);
        queue.trackers.push(UploadFileTracker::app_meta_data(
            file,
            sharing_group,
            upload.contents,
            target,
        ));
        debug!(file_uuid = %file, version = target, "Queued metadata upload");
        Ok(())
    }

    fn enqueue_deletion(
        state: &mut SyncState,
        file: FileUuid,
        sharing_group: SharingGroupId,
    ) -> Result<(), SyncError> {
        if let Some(pending) = state.upload_queues.pending.as_mut() {
            pending.trackers.retain(|t| t.file_uuid != file);
        }

        let committed = state.directory.get(&file).and_then(|e| e.file_version());
        let in_flight = synced_for_file(state, &file)
            .filter(|t| t.carries_content())
            .filter_map(|t| t.file_version)
            .max();
        let latest = committed.max(in_flight);

        state
            .directory
            .entry_or_insert(file, sharing_group)?
            .mark_deleted_locally();

        let Some(version) = latest else {
            info!(file_uuid = %file, "File never reached the server, deletion settled locally");
            return Ok(());
        };

        let mut tracker = UploadFileTracker::deletion(file, sharing_group);
        tracker.file_version = Some(version);
        state
            .upload_queues
            .pending
            .get_or_insert_with(|| UploadQueue::new(sharing_group))
            .trackers
            .push(tracker);
        debug!(file_uuid = %file, version, "Queued upload deletion");
        Ok(())
    }

    /// Snapshots the pending batch into the synced FIFO
    ///
    /// Returns `false` when there was nothing pending.
    pub fn move_pending_to_synced(
        state: &mut SyncState,
        sharing_group_id: &SharingGroupId,
    ) -> Result<bool, SyncError> {
        match &state.upload_queues.pending {
            None => Ok(false),
            Some(pending) if pending.sharing_group_id() != sharing_group_id => {
                Err(SyncError::AlreadyQueuedElsewhere {
                    queued: *pending.sharing_group_id(),
                    requested: *sharing_group_id,
                })
            }
            Some(_) => {
                if let Some(batch) = state.upload_queues.pending.take() {
                    info!(
                        sharing_group = %sharing_group_id,
                        queue_id = %batch.id(),
                        trackers = batch.trackers.len(),
                        "Pending uploads moved to synced queue"
                    );
                    state.upload_queues.synced.push_back(batch);
                }
                Ok(true)
            }
        }
    }

    /// The head synced batch, if it belongs to `sharing_group_id`
    pub fn next_batch<'a>(state: &'a SyncState, sharing_group_id: &SharingGroupId) -> Option<&'a UploadQueue> {
        state
            .upload_queues
            .synced
            .front()
            .filter(|q| q.sharing_group_id() == sharing_group_id)
    }

    pub fn next_batch_mut<'a>(
        state: &'a mut SyncState,
        sharing_group_id: &SharingGroupId,
    ) -> Option<&'a mut UploadQueue> {
        state
            .upload_queues
            .synced
            .front_mut()
            .filter(|q| q.sharing_group_id() == sharing_group_id)
    }

    /// Whether the server index already shows a batch finished with `sent`
    ///
    /// True when the master version moved past `sent` and every change the
    /// batch carries is visible at exactly the version it was uploaded with.
    /// Trackers that came back gone carry no change and are not checked.
    pub fn batch_applied(batch: &UploadQueue, sent: MasterVersion, index: &FileIndex) -> bool {
        if !batch.is_fully_uploaded() || index.master_version.map_or(true, |mv| mv <= sent) {
            return false;
        }
        batch
            .trackers
            .iter()
            .filter(|t| t.gone_reason.is_none())
            .all(|tracker| {
                let remote = index.files.iter().find(|f| f.file_uuid == tracker.file_uuid);
                let meta_matches = !tracker.carries_app_meta_data()
                    || remote.is_some_and(|r| r.app_meta_data_version == tracker.app_meta_data_version);
                match tracker.operation {
                    UploadOperation::Content => {
                        meta_matches
                            && remote.is_some_and(|r| {
                                !r.deleted && Some(r.file_version) == tracker.file_version
                            })
                    }
                    UploadOperation::AppMetaData => meta_matches,
                    UploadOperation::Deletion => remote.map_or(true, |r| r.deleted),
                }
            })
    }

    /// Removes the fully uploaded head batch and commits it to the directory
    ///
    /// Called once `DoneUploads` has succeeded for the batch. Cache entries
    /// of its trackers are dropped, since their outcome is now committed.
    pub fn complete_batch(
        state: &mut SyncState,
        sharing_group_id: &SharingGroupId,
    ) -> Result<UploadQueue, SyncError> {
        let outstanding = match Self::next_batch(state, sharing_group_id) {
            Some(batch) => batch.trackers.iter().filter(|t| t.is_outstanding()).count(),
            None => {
                return Err(DomainError::InvariantViolated(format!(
                    "no synced batch for sharing group {}",
                    sharing_group_id
                ))
                .into())
            }
        };
        if outstanding > 0 {
            return Err(SyncError::BatchIncomplete {
                sharing_group: *sharing_group_id,
                outstanding,
            });
        }

        let Some(batch) = state.upload_queues.synced.pop_front() else {
            return Err(DomainError::InvariantViolated("synced queue emptied".into()).into());
        };

        for tracker in &batch.trackers {
            let entry = state
                .directory
                .entry_or_insert(tracker.file_uuid, *sharing_group_id)?;
            if let Some(reason) = tracker.gone_reason {
                entry.set_gone_reason(Some(reason));
            } else {
                match tracker.operation {
                    UploadOperation::Content => {
                        entry.record_file_group(tracker.file_group_uuid)?;
                        entry.record_mime_type(tracker.mime_type.as_deref());
                        if let Some(version) = tracker.file_version {
                            entry.commit_file_version(version);
                        }
                        if tracker.undelete {
                            entry.clear_deleted_locally();
                        }
                    }
                    UploadOperation::AppMetaData => {}
                    UploadOperation::Deletion => entry.mark_deleted_locally(),
                }
                if let (Some(contents), Some(version)) =
                    (&tracker.app_meta_data, tracker.app_meta_data_version)
                {
                    entry.commit_app_meta_data(contents.clone(), version);
                }
            }
            state.network_cache.remove(&upload_key(tracker));
        }

        info!(
            sharing_group = %sharing_group_id,
            queue_id = %batch.id(),
            trackers = batch.trackers.len(),
            "Upload batch committed"
        );
        Ok(batch)
    }
}

fn synced_for_file<'a>(
    state: &'a SyncState,
    file_uuid: &'a FileUuid,
) -> impl Iterator<Item = &'a UploadFileTracker> + 'a {
    state
        .upload_queues
        .synced
        .iter()
        .flat_map(move |q| q.for_file(file_uuid))
}
