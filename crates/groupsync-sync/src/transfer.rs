//! Transfer engine
//!
//! Executes the network call of one tracker at a time. Before a call is
//! issued its [`OperationKey`] is looked up in the network result cache; a
//! hit is replayed without touching the network. Every step is committed on
//! its own:
//!
//! 1. tracker marked in flight
//! 2. server call
//! 3. outcome written to the cache (cache-backed transfers only)
//! 4. tracker marked complete
//!
//! A crash between 3 and 4 leaves an in-flight tracker with a cached
//! outcome, which [`TransferEngine::reconcile`] replays on start-up.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, warn};

use groupsync_core::domain::{
    CachedOutcome, Direction, DomainError, DownloadFileTracker, DownloadKind, DownloadStatus,
    GoneReason, MasterVersion, OperationKey, OperationKind, StateTransaction, SyncState, TrackerId,
    UploadFileAttributes, UploadFileTracker, UploadOperation, UploadStatus,
};
use groupsync_core::ports::{
    DownloadRequest, IServerApi, IStateStore, ServerResponse, UploadAppMetaDataRequest,
    UploadDeletionRequest, UploadFileRequest,
};

use crate::{commit, SyncError};

// ============================================================================
// Operation keys
// ============================================================================

/// Cache key of an upload tracker's network call
pub fn upload_key(tracker: &UploadFileTracker) -> OperationKey {
    let (kind, version) = match tracker.operation {
        UploadOperation::Content => (OperationKind::Content, tracker.file_version),
        UploadOperation::AppMetaData => (OperationKind::AppMetaData, tracker.app_meta_data_version),
        UploadOperation::Deletion => (OperationKind::Deletion, tracker.file_version),
    };
    OperationKey {
        file_uuid: tracker.file_uuid,
        version: version.unwrap_or(0),
        direction: Direction::Upload,
        kind,
        sharing_group_id: tracker.sharing_group_id,
    }
}

/// Cache key of a download tracker's network call
pub fn download_key(tracker: &DownloadFileTracker) -> OperationKey {
    let (kind, version) = match tracker.kind {
        DownloadKind::Content => (OperationKind::Content, tracker.file_version),
        DownloadKind::AppMetaDataOnly => (
            OperationKind::AppMetaData,
            tracker.app_meta_data_version.unwrap_or(0),
        ),
        DownloadKind::Deletion => (OperationKind::Deletion, tracker.file_version),
    };
    OperationKey {
        file_uuid: tracker.file_uuid,
        version,
        direction: Direction::Download,
        kind,
        sharing_group_id: tracker.sharing_group_id,
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of transmitting one upload tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Uploaded(UploadFileAttributes),
    Gone(UploadFileAttributes, GoneReason),
    /// Nothing was recorded; the tracker is back to `NotStarted`
    MasterVersionConflict(MasterVersion),
}

/// Outcome of fetching one download tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResult {
    Downloaded,
    Gone(GoneReason),
    /// Nothing was recorded; the tracker is back to `NotStarted`
    MasterVersionConflict(MasterVersion),
}

/// What start-up reconciliation did with in-flight trackers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Completed from a cached outcome
    pub replayed: usize,
    /// No cached outcome; back to `NotStarted`
    pub reset: usize,
}

/// Raw server outcome before it is recorded
enum Sent {
    Done(CachedOutcome, u64),
    Conflict(MasterVersion),
}

// ============================================================================
// TransferEngine
// ============================================================================

/// Performs uploads and downloads for single trackers
pub struct TransferEngine {
    server: Arc<dyn IServerApi>,
    download_dir: PathBuf,
    /// Transfers smaller than this bypass the network result cache
    background_threshold_bytes: u64,
}

impl TransferEngine {
    pub fn new(server: Arc<dyn IServerApi>, download_dir: PathBuf, background_threshold_bytes: u64) -> Self {
        Self {
            server,
            download_dir,
            background_threshold_bytes,
        }
    }

    fn is_cache_backed(&self, size: u64) -> bool {
        size >= self.background_threshold_bytes
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Transmits one upload tracker, or replays its cached outcome
    ///
    /// # Errors
    /// `NonConsecutiveVersion` if the tracker no longer targets the next
    /// version, `Server` on transport failure (the tracker is reset),
    /// `Storage` if a step cannot be committed.
    pub async fn upload(
        &self,
        state: &mut SyncState,
        store: &dyn IStateStore,
        tracker_id: &TrackerId,
        master_version: MasterVersion,
    ) -> Result<UploadResult, SyncError> {
        let tracker = state
            .upload_queues
            .tracker(tracker_id)
            .cloned()
            .ok_or_else(|| DomainError::InvariantViolated(format!("upload tracker {} is not queued", tracker_id)))?;
        let key = upload_key(&tracker);

        if let Some(cached) = state.network_cache.get(&key).map(|r| r.outcome.clone()) {
            debug!(operation = %key, "Replaying cached upload outcome");
            return finish_upload(state, store, tracker_id, cached).await;
        }

        validate_versions(state, &tracker)?;

        let mut tx = StateTransaction::begin(state);
        if let Some(t) = tx.upload_queues.tracker_mut(tracker_id) {
            if t.status() == UploadStatus::NotStarted {
                t.start()?;
            }
        }
        *state = commit(tx, store).await?;

        debug!(
            file_uuid = %tracker.file_uuid,
            operation = %tracker.operation,
            master_version = master_version.value(),
            "Uploading"
        );
        let sent = match self.send_upload(&tracker, master_version).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(file_uuid = %tracker.file_uuid, error = %e, "Upload failed, tracker reset");
                reset_upload(state, store, tracker_id).await?;
                return Err(e);
            }
        };

        let (outcome, size) = match sent {
            Sent::Done(outcome, size) => (outcome, size),
            Sent::Conflict(current) => {
                reset_upload(state, store, tracker_id).await?;
                return Ok(UploadResult::MasterVersionConflict(current));
            }
        };

        if self.is_cache_backed(size) {
            let mut tx = StateTransaction::begin(state);
            tx.network_cache.put(key, outcome.clone(), Utc::now());
            *state = commit(tx, store).await?;
        }

        finish_upload(state, store, tracker_id, outcome).await
    }

    async fn send_upload(&self, tracker: &UploadFileTracker, master_version: MasterVersion) -> Result<Sent, SyncError> {
        let (response, size) = match tracker.operation {
            UploadOperation::Content => {
                let path = tracker.local_path.as_ref().ok_or_else(|| {
                    DomainError::InvariantViolated(format!("content upload {} has no local path", tracker.id()))
                })?;
                let contents = tokio::fs::read(path).await?;
                let size = contents.len() as u64;
                let request = UploadFileRequest {
                    file_uuid: tracker.file_uuid,
                    sharing_group_id: tracker.sharing_group_id,
                    file_group_uuid: tracker.file_group_uuid,
                    mime_type: tracker.mime_type.clone(),
                    file_version: tracker.file_version.unwrap_or(0),
                    app_meta_data: tracker.app_meta_data.clone().zip(tracker.app_meta_data_version),
                    undelete: tracker.undelete,
                    master_version,
                    contents,
                };
                let response = self
                    .server
                    .upload_file(&request)
                    .await
                    .context("UploadFile failed")
                    .map_err(SyncError::Server)?;
                (response, size)
            }
            UploadOperation::AppMetaData => {
                let contents = tracker.app_meta_data.clone().unwrap_or_default();
                let size = contents.len() as u64;
                let request = UploadAppMetaDataRequest {
                    file_uuid: tracker.file_uuid,
                    sharing_group_id: tracker.sharing_group_id,
                    contents,
                    version: tracker.app_meta_data_version.unwrap_or(0),
                    master_version,
                };
                let response = self
                    .server
                    .upload_app_meta_data(&request)
                    .await
                    .context("UploadAppMetaData failed")
                    .map_err(SyncError::Server)?;
                (response, size)
            }
            UploadOperation::Deletion => {
                let request = UploadDeletionRequest {
                    file_uuid: tracker.file_uuid,
                    sharing_group_id: tracker.sharing_group_id,
                    file_version: tracker.file_version,
                    master_version,
                };
                let response = self
                    .server
                    .upload_deletion(&request)
                    .await
                    .context("UploadDeletion failed")
                    .map_err(SyncError::Server)?;
                (response, 0)
            }
        };

        Ok(match response {
            ServerResponse::Success(()) => Sent::Done(CachedOutcome::Uploaded, size),
            ServerResponse::Gone(reason) => Sent::Done(CachedOutcome::Gone { reason }, size),
            ServerResponse::MasterVersionConflict { current } => Sent::Conflict(current),
        })
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Fetches one download tracker, or replays its cached outcome
    ///
    /// Content is written to `<download_dir>/<file_uuid>.<version>`.
    pub async fn download(
        &self,
        state: &mut SyncState,
        store: &dyn IStateStore,
        tracker_id: &TrackerId,
        master_version: MasterVersion,
    ) -> Result<DownloadResult, SyncError> {
        let tracker = state
            .download_groups
            .tracker(tracker_id)
            .cloned()
            .ok_or_else(|| DomainError::InvariantViolated(format!("download tracker {} is unknown", tracker_id)))?;
        let key = download_key(&tracker);

        if let Some(cached) = state.network_cache.get(&key).map(|r| r.outcome.clone()) {
            debug!(operation = %key, "Replaying cached download outcome");
            return finish_download(state, store, tracker_id, cached).await;
        }

        let mut tx = StateTransaction::begin(state);
        if let Some(t) = tx.download_groups.tracker_mut(tracker_id) {
            t.start()?;
        }
        *state = commit(tx, store).await?;

        debug!(
            file_uuid = %tracker.file_uuid,
            kind = %tracker.kind,
            version = key.version,
            "Downloading"
        );
        let sent = match self.fetch(&tracker, key.version, master_version).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(file_uuid = %tracker.file_uuid, error = %e, "Download failed, tracker reset");
                reset_download(state, store, tracker_id).await?;
                return Err(e);
            }
        };

        let (outcome, size) = match sent {
            Sent::Done(outcome, size) => (outcome, size),
            Sent::Conflict(current) => {
                reset_download(state, store, tracker_id).await?;
                return Ok(DownloadResult::MasterVersionConflict(current));
            }
        };

        if self.is_cache_backed(size) {
            let mut tx = StateTransaction::begin(state);
            tx.network_cache.put(key, outcome.clone(), Utc::now());
            *state = commit(tx, store).await?;
        }

        finish_download(state, store, tracker_id, outcome).await
    }

    async fn fetch(
        &self,
        tracker: &DownloadFileTracker,
        version: u64,
        master_version: MasterVersion,
    ) -> Result<Sent, SyncError> {
        let request = DownloadRequest {
            file_uuid: tracker.file_uuid,
            sharing_group_id: tracker.sharing_group_id,
            version,
            master_version,
        };

        match tracker.kind {
            DownloadKind::Content => {
                let response = self
                    .server
                    .download_file(&request)
                    .await
                    .context("DownloadFile failed")
                    .map_err(SyncError::Server)?;
                Ok(match response {
                    ServerResponse::Success(download) => {
                        let size = download.contents.len() as u64;
                        let path = self.write_download(tracker, &download.contents).await?;
                        Sent::Done(
                            CachedOutcome::Downloaded {
                                local_path: Some(path),
                                app_meta_data: download.app_meta_data,
                            },
                            size,
                        )
                    }
                    ServerResponse::Gone(reason) => Sent::Done(CachedOutcome::Gone { reason }, 0),
                    ServerResponse::MasterVersionConflict { current } => Sent::Conflict(current),
                })
            }
            DownloadKind::AppMetaDataOnly => {
                let response = self
                    .server
                    .download_app_meta_data(&request)
                    .await
                    .context("DownloadAppMetaData failed")
                    .map_err(SyncError::Server)?;
                Ok(match response {
                    ServerResponse::Success(contents) => {
                        let size = contents.len() as u64;
                        Sent::Done(
                            CachedOutcome::Downloaded {
                                local_path: None,
                                app_meta_data: Some(contents),
                            },
                            size,
                        )
                    }
                    ServerResponse::Gone(reason) => Sent::Done(CachedOutcome::Gone { reason }, 0),
                    ServerResponse::MasterVersionConflict { current } => Sent::Conflict(current),
                })
            }
            DownloadKind::Deletion => Ok(Sent::Done(
                CachedOutcome::Downloaded {
                    local_path: None,
                    app_meta_data: None,
                },
                0,
            )),
        }
    }

    async fn write_download(&self, tracker: &DownloadFileTracker, contents: &[u8]) -> Result<PathBuf, SyncError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self
            .download_dir
            .join(format!("{}.{}", tracker.file_uuid, tracker.file_version));
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    // ========================================================================
    // Crash reconciliation
    // ========================================================================

    /// Settles trackers left in flight by an earlier process
    ///
    /// A tracker with a cached outcome is completed from it without a
    /// network call; one without is reset so it is sent again.
    pub fn reconcile(state: &mut SyncState) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();

        let in_flight: Vec<UploadFileTracker> = state
            .upload_queues
            .all()
            .flat_map(|q| q.trackers.iter())
            .filter(|t| t.status() == UploadStatus::Uploading)
            .cloned()
            .collect();
        for tracker in in_flight {
            let cached = state
                .network_cache
                .get(&upload_key(&tracker))
                .map(|r| r.outcome.clone());
            let Some(t) = state.upload_queues.tracker_mut(tracker.id()) else {
                continue;
            };
            match cached {
                Some(outcome) => {
                    apply_upload_outcome(t, &outcome)?;
                    report.replayed += 1;
                }
                None => {
                    warn!(
                        file_uuid = %tracker.file_uuid,
                        operation = %tracker.operation,
                        "Upload was in flight without a recorded outcome, will resend"
                    );
                    t.reset()?;
                    report.reset += 1;
                }
            }
        }

        let in_flight: Vec<DownloadFileTracker> = state
            .download_groups
            .trackers()
            .iter()
            .filter(|t| t.status() == DownloadStatus::Downloading)
            .cloned()
            .collect();
        for tracker in in_flight {
            let cached = state
                .network_cache
                .get(&download_key(&tracker))
                .map(|r| r.outcome.clone());
            let Some(t) = state.download_groups.tracker_mut(tracker.id()) else {
                continue;
            };
            match cached {
                Some(outcome) => {
                    apply_download_outcome(t, outcome)?;
                    report.replayed += 1;
                }
                None => {
                    warn!(
                        file_uuid = %tracker.file_uuid,
                        kind = %tracker.kind,
                        "Download was in flight without a recorded outcome, will refetch"
                    );
                    t.reset()?;
                    report.reset += 1;
                }
            }
        }

        Ok(report)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// The head batch's trackers must target exactly the next versions
fn validate_versions(state: &SyncState, tracker: &UploadFileTracker) -> Result<(), SyncError> {
    let entry = state.directory.get(&tracker.file_uuid);

    if tracker.carries_content() {
        let expected = entry.map_or(0, |e| e.next_file_version());
        let actual = tracker.file_version.unwrap_or(0);
        if actual != expected {
            return Err(SyncError::NonConsecutiveVersion {
                file: tracker.file_uuid,
                expected,
                actual,
            });
        }
    }
    if let Some(actual) = tracker.app_meta_data_version {
        let expected = entry.map_or(0, |e| e.next_app_meta_data_version());
        if actual != expected {
            return Err(SyncError::NonConsecutiveVersion {
                file: tracker.file_uuid,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

fn apply_upload_outcome(tracker: &mut UploadFileTracker, outcome: &CachedOutcome) -> Result<(), SyncError> {
    match outcome {
        CachedOutcome::Uploaded => {}
        CachedOutcome::Gone { reason } => tracker.gone_reason = Some(*reason),
        CachedOutcome::Downloaded { .. } => {
            return Err(DomainError::InvariantViolated(format!(
                "download outcome cached for upload tracker {}",
                tracker.id()
            ))
            .into())
        }
    }
    tracker.complete()?;
    Ok(())
}

fn apply_download_outcome(tracker: &mut DownloadFileTracker, outcome: CachedOutcome) -> Result<(), SyncError> {
    match outcome {
        CachedOutcome::Downloaded {
            local_path,
            app_meta_data,
        } => {
            tracker.local_path = local_path;
            if app_meta_data.is_some() {
                tracker.app_meta_data = app_meta_data;
            }
        }
        CachedOutcome::Gone { reason } => tracker.gone_reason = Some(reason),
        CachedOutcome::Uploaded => {
            return Err(DomainError::InvariantViolated(format!(
                "upload outcome cached for download tracker {}",
                tracker.id()
            ))
            .into())
        }
    }
    tracker.complete()?;
    Ok(())
}

async fn finish_upload(
    state: &mut SyncState,
    store: &dyn IStateStore,
    tracker_id: &TrackerId,
    outcome: CachedOutcome,
) -> Result<UploadResult, SyncError> {
    let mut tx = StateTransaction::begin(state);
    let tracker = tx
        .upload_queues
        .tracker_mut(tracker_id)
        .ok_or_else(|| DomainError::InvariantViolated(format!("upload tracker {} vanished", tracker_id)))?;
    apply_upload_outcome(tracker, &outcome)?;
    let attributes = UploadFileAttributes::from(&*tracker);
    *state = commit(tx, store).await?;

    Ok(match outcome {
        CachedOutcome::Gone { reason } => UploadResult::Gone(attributes, reason),
        _ => UploadResult::Uploaded(attributes),
    })
}

async fn finish_download(
    state: &mut SyncState,
    store: &dyn IStateStore,
    tracker_id: &TrackerId,
    outcome: CachedOutcome,
) -> Result<DownloadResult, SyncError> {
    let gone = match &outcome {
        CachedOutcome::Gone { reason } => Some(*reason),
        _ => None,
    };
    let mut tx = StateTransaction::begin(state);
    let tracker = tx
        .download_groups
        .tracker_mut(tracker_id)
        .ok_or_else(|| DomainError::InvariantViolated(format!("download tracker {} vanished", tracker_id)))?;
    apply_download_outcome(tracker, outcome)?;
    *state = commit(tx, store).await?;

    Ok(match gone {
        Some(reason) => DownloadResult::Gone(reason),
        None => DownloadResult::Downloaded,
    })
}

async fn reset_upload(state: &mut SyncState, store: &dyn IStateStore, tracker_id: &TrackerId) -> Result<(), SyncError> {
    let mut tx = StateTransaction::begin(state);
    if let Some(t) = tx.upload_queues.tracker_mut(tracker_id) {
        if t.status() == UploadStatus::Uploading {
            t.reset()?;
        }
    }
    *state = commit(tx, store).await?;
    Ok(())
}

async fn reset_download(state: &mut SyncState, store: &dyn IStateStore, tracker_id: &TrackerId) -> Result<(), SyncError> {
    let mut tx = StateTransaction::begin(state);
    if let Some(t) = tx.download_groups.tracker_mut(tracker_id) {
        if t.status() == DownloadStatus::Downloading {
            t.reset()?;
        }
    }
    *state = commit(tx, store).await?;
    Ok(())
}
