//! Sync orchestrator - the per-sharing-group state machine
//!
//! A pass for one sharing group runs through these phases:
//!
//! ```text
//! Idle → Started → Uploading → Downloading → Done → Idle
//!           │           │            │
//!           └───────────┴────────────┴──→ Stopping → Idle
//!                                    └──→ Error → Idle
//! ```
//!
//! Stop requests are honoured only at step boundaries:
//! - before each tracker transfer
//! - before `DoneUploads`
//! - before each change check
//!
//! A transfer already in flight always runs to completion and is committed.
//!
//! Before a batch is sent the server index is read once, so remote changes
//! that collide with the batch become decisions instead of failed uploads.
//!
//! Master-version conflicts from an upload or from `DoneUploads` trigger the
//! download phase (an authoritative re-read of the server index) and a
//! restart of the batch. Trackers already uploaded are not sent again.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use groupsync_conflict::{ConflictDetector, ConflictPolicy, ConflictResolver};
use groupsync_core::config::Config;
use groupsync_core::domain::{
    ConflictResolution, DecisionId, DecisionKind, DirectoryEntry, DownloadStatus, FileUuid,
    MasterVersion, PendingDecision, ResolutionSource, SharingGroup, SharingGroupId,
    StateTransaction, SyncState, UploadQueue, UploadQueues,
};
use groupsync_core::ports::{
    DeliveredGroup, IServerApi, IStateStore, ISyncDelegate, InvitationInfo, Permission,
    ServerResponse,
};

use crate::download::{ChangeCheck, DownloadScanner};
use crate::scheduler::SyncScheduler;
use crate::transfer::{DownloadResult, TransferEngine, UploadResult};
use crate::upload_queue::{UploadChange, UploadQueueManager};
use crate::{commit, SyncError};

// ============================================================================
// Settings and phases
// ============================================================================

/// Orchestrator settings taken from [`Config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Master-version conflicts tolerated within one pass
    pub max_master_version_retries: u32,
    /// Age after which network result cache entries are dropped
    pub network_cache_ttl: chrono::Duration,
    pub download_dir: PathBuf,
    pub background_threshold_bytes: u64,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        let ttl_secs = config.sync.network_cache_ttl_secs.min(i64::MAX as u64 / 1_000) as i64;
        Self {
            max_master_version_retries: config.sync.max_master_version_retries,
            network_cache_ttl: chrono::Duration::seconds(ttl_secs),
            download_dir: config.sync.download_dir.clone(),
            background_threshold_bytes: config.transfer.background_threshold_bytes,
        }
    }
}

/// Where the orchestrator currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    Started,
    Uploading,
    Downloading,
    Done,
    Stopping,
    Error,
}

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Completed,
    /// The head batch touches a file with an open decision
    Blocked,
    Stopped,
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

/// Drives sync passes and exposes the public sync operations
///
/// All state mutation happens through `&mut self`, so a single orchestrator
/// is the serialized context for its store. Other tasks interact through the
/// cloneable [`SyncScheduler`] handle.
pub struct SyncOrchestrator {
    server: Arc<dyn IServerApi>,
    store: Arc<dyn IStateStore>,
    delegate: Arc<dyn ISyncDelegate>,
    scheduler: SyncScheduler,
    settings: SyncSettings,
    policy: ConflictPolicy,
    transfer: TransferEngine,
    state: SyncState,
    phase: SyncPhase,
}

impl SyncOrchestrator {
    /// Loads the persisted state and settles transfers left in flight
    ///
    /// # Errors
    /// `Storage` if the state cannot be loaded or the reconciled state
    /// cannot be committed.
    pub async fn open(
        server: Arc<dyn IServerApi>,
        store: Arc<dyn IStateStore>,
        delegate: Arc<dyn ISyncDelegate>,
        config: &Config,
    ) -> Result<Self, SyncError> {
        let loaded = store.load().await.map_err(SyncError::Storage)?;

        let mut tx = StateTransaction::begin(&loaded);
        let report = TransferEngine::reconcile(&mut tx)?;
        let state = if report.replayed + report.reset > 0 {
            info!(
                replayed = report.replayed,
                reset = report.reset,
                "Reconciled transfers left in flight"
            );
            commit(tx, store.as_ref()).await?
        } else {
            tx.rollback();
            loaded
        };

        let settings = SyncSettings::from_config(config);
        let transfer = TransferEngine::new(
            Arc::clone(&server),
            settings.download_dir.clone(),
            settings.background_threshold_bytes,
        );
        let scheduler = SyncScheduler::new();
        for sharing_group_id in &state.sync_requests {
            debug!(sharing_group = %sharing_group_id, "Sync request carried over");
        }

        Ok(Self {
            server,
            store,
            delegate,
            scheduler,
            policy: ConflictPolicy::from_config(&config.conflicts.default_strategy),
            settings,
            transfer,
            state,
            phase: SyncPhase::Idle,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Handle for requesting syncs and stops from other tasks
    pub fn scheduler(&self) -> SyncScheduler {
        self.scheduler.clone()
    }

    pub fn sharing_groups(&self) -> Vec<SharingGroup> {
        self.state.sharing_groups.values().cloned().collect()
    }

    pub fn directory_entry(&self, file_uuid: &FileUuid) -> Option<&DirectoryEntry> {
        self.state.directory.get(file_uuid)
    }

    pub fn pending_decisions(&self) -> &[PendingDecision] {
        &self.state.decisions
    }

    /// Upload trackers not yet uploaded, pending and synced
    pub fn pending_upload_count(&self) -> usize {
        self.state.upload_queues.outstanding_count()
    }

    // ========================================================================
    // Local changes
    // ========================================================================

    /// Validates and queues a local change into the pending batch
    pub async fn enqueue(&mut self, change: impl Into<UploadChange>) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        UploadQueueManager::enqueue(&mut tx, change.into())?;
        self.state = commit(tx, self.store.as_ref()).await?;
        Ok(())
    }

    // ========================================================================
    // Sync passes
    // ========================================================================

    /// Runs a sync pass for a sharing group, then any passes requested meanwhile
    ///
    /// The pending batch of this sharing group is moved to the synced queue
    /// first. If other requests are ahead in the queue they run first and the
    /// delegate receives `sync_delayed`.
    ///
    /// # Errors
    /// `UnknownSharingGroup`, `SharingGroupRemoved` and
    /// `AlreadyQueuedElsewhere` are returned before anything runs. Errors
    /// from a pass are reported through `sync_server_error_occurred` and
    /// returned; the work done so far stays committed.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&mut self, sharing_group_id: SharingGroupId) -> Result<(), SyncError> {
        UploadQueueManager::check_sharing_group(&self.state, &sharing_group_id)?;

        let mut tx = StateTransaction::begin(&self.state);
        UploadQueueManager::move_pending_to_synced(&mut tx, &sharing_group_id)?;
        let delayed = match tx.sync_requests.front() {
            Some(front) => *front != sharing_group_id,
            None => false,
        };
        if !tx.sync_requests.contains(&sharing_group_id) {
            tx.sync_requests.push_back(sharing_group_id);
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        if delayed {
            self.delegate.sync_delayed(&sharing_group_id);
        }

        self.scheduler.clear_stop();
        self.scheduler.set_active(true);
        let result = self.run_requests().await;
        self.scheduler.set_active(false);
        self.scheduler.clear_stop();
        self.phase = SyncPhase::Idle;
        result
    }

    /// Runs queued requests until the queue is empty, a stop, or an error
    async fn run_requests(&mut self) -> Result<(), SyncError> {
        loop {
            self.absorb_requests().await?;

            let Some(sharing_group_id) = self.state.sync_requests.front().copied() else {
                return Ok(());
            };

            match self.run_pass(sharing_group_id).await {
                Ok(Step::Stopped) => {
                    self.phase = SyncPhase::Stopping;
                    info!(sharing_group = %sharing_group_id, "Sync stopped");
                    self.delegate.sync_stopping(&sharing_group_id);
                    return Ok(());
                }
                Ok(_) => {
                    let mut tx = StateTransaction::begin(&self.state);
                    tx.sync_requests.retain(|id| *id != sharing_group_id);
                    self.state = commit(tx, self.store.as_ref()).await?;
                    self.phase = SyncPhase::Done;
                    info!(sharing_group = %sharing_group_id, "Sync done");
                    self.delegate.sync_done(&sharing_group_id);
                }
                Err(e) => {
                    self.phase = SyncPhase::Error;
                    error!(sharing_group = %sharing_group_id, error = %e, "Sync pass failed");
                    self.delegate
                        .sync_server_error_occurred(Some(&sharing_group_id), &e.to_string());
                    if matches!(e, SyncError::SharingGroupRemoved(_) | SyncError::UnknownSharingGroup(_)) {
                        let mut tx = StateTransaction::begin(&self.state);
                        forget_sharing_group(&mut tx, &sharing_group_id);
                        self.state = commit(tx, self.store.as_ref()).await?;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Moves requests made through the scheduler into the persisted queue
    async fn absorb_requests(&mut self) -> Result<(), SyncError> {
        let requested = self.scheduler.take_requests();
        if requested.is_empty() {
            return Ok(());
        }
        let mut tx = StateTransaction::begin(&self.state);
        let mut delayed = Vec::new();
        for sharing_group_id in requested {
            if tx.sync_requests.contains(&sharing_group_id) {
                continue;
            }
            if UploadQueueManager::check_sharing_group(&tx, &sharing_group_id).is_err() {
                warn!(sharing_group = %sharing_group_id, "Ignoring sync request for unavailable sharing group");
                continue;
            }
            tx.sync_requests.push_back(sharing_group_id);
            delayed.push(sharing_group_id);
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        for sharing_group_id in &delayed {
            self.delegate.sync_delayed(sharing_group_id);
        }
        Ok(())
    }

    async fn run_pass(&mut self, sharing_group_id: SharingGroupId) -> Result<Step, SyncError> {
        UploadQueueManager::check_sharing_group(&self.state, &sharing_group_id)?;
        self.phase = SyncPhase::Started;
        info!(sharing_group = %sharing_group_id, "Sync started");
        self.delegate.sync_started(&sharing_group_id);

        let mut tx = StateTransaction::begin(&self.state);
        let dropped = tx.network_cache.gc(self.settings.network_cache_ttl, Utc::now());
        let pending_here = tx
            .upload_queues
            .pending
            .as_ref()
            .is_some_and(|q| q.sharing_group_id() == &sharing_group_id);
        if pending_here {
            UploadQueueManager::move_pending_to_synced(&mut tx, &sharing_group_id)?;
        }
        if dropped > 0 || pending_here {
            if dropped > 0 {
                debug!(dropped, "Expired network results dropped");
            }
            self.state = commit(tx, self.store.as_ref()).await?;
        }

        let mut retries = 0;

        self.phase = SyncPhase::Uploading;
        if self.upload_phase(sharing_group_id, &mut retries).await? == Step::Stopped {
            return Ok(Step::Stopped);
        }

        self.phase = SyncPhase::Downloading;
        if self.download_phase(sharing_group_id, &mut retries).await? == Step::Stopped {
            return Ok(Step::Stopped);
        }

        let mut tx = StateTransaction::begin(&self.state);
        if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
            group.clear_sync_needed();
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        Ok(Step::Completed)
    }

    // ========================================================================
    // Upload phase
    // ========================================================================

    async fn upload_phase(&mut self, sharing_group_id: SharingGroupId, retries: &mut u32) -> Result<Step, SyncError> {
        if UploadQueueManager::next_batch(&self.state, &sharing_group_id).is_none() {
            return Ok(Step::Completed);
        }
        if self.scheduler.is_stop_requested() {
            return Ok(Step::Stopped);
        }
        self.settle_unanswered_batch(sharing_group_id).await?;
        // collisions with remote changes must be decided before anything is sent
        self.scan(sharing_group_id, retries).await?;

        let mut announced = None;

        loop {
            if self.scheduler.is_stop_requested() {
                return Ok(Step::Stopped);
            }

            let Some(batch) = UploadQueueManager::next_batch(&self.state, &sharing_group_id).cloned() else {
                return Ok(Step::Completed);
            };

            if batch.is_empty() {
                let mut tx = StateTransaction::begin(&self.state);
                UploadQueueManager::complete_batch(&mut tx, &sharing_group_id)?;
                self.state = commit(tx, self.store.as_ref()).await?;
                continue;
            }

            if batch_blocked(&self.state, &batch) {
                info!(
                    sharing_group = %sharing_group_id,
                    queue_id = %batch.id(),
                    "Upload batch waits for a conflict decision"
                );
                return Ok(Step::Blocked);
            }

            if announced != Some(*batch.id()) {
                announced = Some(*batch.id());
                self.delegate
                    .will_start_uploads(&sharing_group_id, batch.content_count(), batch.deletion_count());
            }

            let master_version = self.master_version(&sharing_group_id)?;
            let mut conflict = None;

            for tracker in batch.trackers.iter().filter(|t| t.is_outstanding()) {
                if self.scheduler.is_stop_requested() {
                    return Ok(Step::Stopped);
                }
                let result = self
                    .transfer
                    .upload(&mut self.state, self.store.as_ref(), tracker.id(), master_version)
                    .await?;
                match result {
                    UploadResult::Uploaded(attributes) => self.delegate.single_file_upload_complete(&attributes),
                    UploadResult::Gone(attributes, reason) => {
                        warn!(file_uuid = %attributes.file_uuid, %reason, "Upload gone");
                        self.delegate.file_gone(&sharing_group_id, &attributes.file_uuid, reason);
                    }
                    UploadResult::MasterVersionConflict(current) => {
                        conflict = Some(current);
                        break;
                    }
                }
            }

            if conflict.is_none() {
                if self.scheduler.is_stop_requested() {
                    return Ok(Step::Stopped);
                }
                self.set_done_uploads_marker(&sharing_group_id, Some(master_version)).await?;
                let response = self
                    .server
                    .done_uploads(&sharing_group_id, master_version, batch.deletion_count())
                    .await
                    .context("DoneUploads failed")
                    .map_err(SyncError::Server)?;
                match response {
                    ServerResponse::Success(count) => {
                        let mut tx = StateTransaction::begin(&self.state);
                        let committed = UploadQueueManager::complete_batch(&mut tx, &sharing_group_id)?;
                        if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
                            group.set_master_version(master_version.next());
                        }
                        self.state = commit(tx, self.store.as_ref()).await?;
                        info!(
                            sharing_group = %sharing_group_id,
                            master_version = master_version.next().value(),
                            committed = count,
                            "Upload batch done"
                        );
                        self.report_batch_done(&sharing_group_id, &committed);
                        continue;
                    }
                    ServerResponse::Gone(reason) => {
                        warn!(sharing_group = %sharing_group_id, %reason, "Sharing group gone during DoneUploads");
                        self.mark_removed(&sharing_group_id).await?;
                        return Err(SyncError::SharingGroupRemoved(sharing_group_id));
                    }
                    ServerResponse::MasterVersionConflict { current } => {
                        self.set_done_uploads_marker(&sharing_group_id, None).await?;
                        conflict = Some(current);
                    }
                }
            }

            if let Some(current) = conflict {
                self.note_conflict(&sharing_group_id, retries, current)?;
                if self.download_phase(sharing_group_id, retries).await? == Step::Stopped {
                    return Ok(Step::Stopped);
                }
                self.phase = SyncPhase::Uploading;
            }
        }
    }

    /// Settles a head batch whose `DoneUploads` answer never got committed
    ///
    /// The server index decides. If it shows every change of the batch past
    /// the master version the call carried, the batch is committed locally
    /// and not sent again. Otherwise the marker is cleared and the batch is
    /// finished the usual way.
    async fn settle_unanswered_batch(&mut self, sharing_group_id: SharingGroupId) -> Result<(), SyncError> {
        let Some(batch) = UploadQueueManager::next_batch(&self.state, &sharing_group_id) else {
            return Ok(());
        };
        let Some(sent) = batch.done_uploads_sent() else {
            return Ok(());
        };
        let index = self
            .server
            .file_index(Some(&sharing_group_id))
            .await
            .context("FileIndex failed")
            .map_err(SyncError::Server)?;

        if !UploadQueueManager::batch_applied(batch, sent, &index) {
            info!(
                sharing_group = %sharing_group_id,
                master_version = sent.value(),
                "Unanswered DoneUploads was not applied"
            );
            return self.set_done_uploads_marker(&sharing_group_id, None).await;
        }

        let mut tx = StateTransaction::begin(&self.state);
        let committed = UploadQueueManager::complete_batch(&mut tx, &sharing_group_id)?;
        if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
            group.set_master_version(sent.next());
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        warn!(
            sharing_group = %sharing_group_id,
            queue_id = %committed.id(),
            master_version = sent.next().value(),
            "Upload batch was applied before its answer was committed"
        );
        self.report_batch_done(&sharing_group_id, &committed);
        Ok(())
    }

    async fn set_done_uploads_marker(
        &mut self,
        sharing_group_id: &SharingGroupId,
        master_version: Option<MasterVersion>,
    ) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        let Some(batch) = UploadQueueManager::next_batch_mut(&mut tx, sharing_group_id) else {
            tx.rollback();
            return Ok(());
        };
        match master_version {
            Some(mv) => batch.mark_done_uploads_sent(mv)?,
            None => batch.clear_done_uploads_sent(),
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        Ok(())
    }

    fn report_batch_done(&self, sharing_group_id: &SharingGroupId, committed: &UploadQueue) {
        let content = committed
            .trackers
            .iter()
            .filter(|t| !t.is_deletion() && t.gone_reason.is_none())
            .count();
        if content > 0 {
            self.delegate.content_uploads_completed(sharing_group_id, content);
        }
        let deletions = committed.deletion_count();
        if deletions > 0 {
            self.delegate.upload_deletions_completed(sharing_group_id, deletions);
        }
    }

    // ========================================================================
    // Download phase
    // ========================================================================

    async fn download_phase(&mut self, sharing_group_id: SharingGroupId, retries: &mut u32) -> Result<Step, SyncError> {
        'scan: loop {
            if self.scheduler.is_stop_requested() {
                return Ok(Step::Stopped);
            }

            match self.scan(sharing_group_id, retries).await? {
                ChangeCheck::ChangesAvailable { content, .. } => {
                    self.delegate.will_start_downloads(&sharing_group_id, content);
                }
                _ => return Ok(Step::Completed),
            }
            self.deliver_ready(&sharing_group_id).await?;

            loop {
                if self.scheduler.is_stop_requested() {
                    return Ok(Step::Stopped);
                }
                let Some(tracker_id) = DownloadScanner::next(&self.state, &sharing_group_id)? else {
                    break;
                };
                let file_uuid = self
                    .state
                    .download_groups
                    .tracker(&tracker_id)
                    .map(|t| t.file_uuid);
                let master_version = self.master_version(&sharing_group_id)?;

                let result = self
                    .transfer
                    .download(&mut self.state, self.store.as_ref(), &tracker_id, master_version)
                    .await?;
                match result {
                    DownloadResult::Downloaded => {}
                    DownloadResult::Gone(reason) => {
                        if let Some(file_uuid) = file_uuid {
                            warn!(%file_uuid, %reason, "Download gone");
                            self.delegate.file_gone(&sharing_group_id, &file_uuid, reason);
                        }
                    }
                    DownloadResult::MasterVersionConflict(current) => {
                        self.note_conflict(&sharing_group_id, retries, current)?;
                        let mut tx = StateTransaction::begin(&self.state);
                        DownloadScanner::discard(&mut tx, &sharing_group_id);
                        self.state = commit(tx, self.store.as_ref()).await?;
                        continue 'scan;
                    }
                }

                self.deliver_ready(&sharing_group_id).await?;
            }

            return Ok(Step::Completed);
        }
    }

    /// Reads the server index, plans downloads and routes new conflicts
    ///
    /// Stale download groups are discarded and the index is read again.
    /// Never returns `ChangeCheck::MasterVersionConflict`.
    async fn scan(&mut self, sharing_group_id: SharingGroupId, retries: &mut u32) -> Result<ChangeCheck, SyncError> {
        loop {
            let mut tx = StateTransaction::begin(&self.state);
            let check = match DownloadScanner::check_for_changes(self.server.as_ref(), &mut tx, &sharing_group_id).await {
                Err(SyncError::SharingGroupRemoved(id)) => {
                    tx.rollback();
                    self.mark_removed(&id).await?;
                    return Err(SyncError::SharingGroupRemoved(id));
                }
                other => other?,
            };

            if let ChangeCheck::MasterVersionConflict(current) = check {
                self.note_conflict(&sharing_group_id, retries, current)?;
                DownloadScanner::discard(&mut tx, &sharing_group_id);
                self.state = commit(tx, self.store.as_ref()).await?;
                continue;
            }

            self.state = commit(tx, self.store.as_ref()).await?;
            if check != ChangeCheck::NoChanges {
                self.route_conflicts(&sharing_group_id).await?;
            }
            return Ok(check);
        }
    }

    /// Records decisions for new collisions and answers what can be answered
    ///
    /// The delegate is asked first, then the configured policy. Decisions
    /// neither answers stay pending for `resolve_conflict`.
    async fn route_conflicts(&mut self, sharing_group_id: &SharingGroupId) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        let created = ConflictDetector::detect(&mut tx, sharing_group_id);
        if created.is_empty() {
            tx.rollback();
            return Ok(());
        }
        self.state = commit(tx, self.store.as_ref()).await?;

        for decision in created {
            let answer = match self.ask_delegate(&decision) {
                Some(resolution) => Some((resolution, ResolutionSource::Delegate)),
                None => self
                    .policy
                    .decide(&decision)
                    .map(|resolution| (resolution, ResolutionSource::Policy)),
            };
            let Some((resolution, source)) = answer else {
                info!(decision = %decision.id(), "Conflict left pending");
                continue;
            };

            let mut tx = StateTransaction::begin(&self.state);
            match ConflictResolver::resolve(&mut tx, decision.id(), resolution, source) {
                Ok(_) => self.state = commit(tx, self.store.as_ref()).await?,
                Err(e) => {
                    warn!(decision = %decision.id(), %source, error = %e, "Resolution rejected, decision left pending");
                    tx.rollback();
                }
            }
        }
        Ok(())
    }

    fn ask_delegate(&self, decision: &PendingDecision) -> Option<ConflictResolution> {
        match decision.kind() {
            DecisionKind::DownloadDeletion(conflict) => self
                .delegate
                .must_resolve_download_deletion_conflicts(decision, conflict)
                .map(Into::into),
            DecisionKind::ContentDownload(conflict) => self
                .delegate
                .must_resolve_content_download_conflict(decision, conflict)
                .map(Into::into),
        }
    }

    async fn deliver_ready(&mut self, sharing_group_id: &SharingGroupId) -> Result<(), SyncError> {
        for group_id in DownloadScanner::ready_groups(&self.state, sharing_group_id) {
            let mut tx = StateTransaction::begin(&self.state);
            let delivered = DownloadScanner::deliver(&mut tx, &group_id)?;
            self.state = commit(tx, self.store.as_ref()).await?;
            if let Some(group) = delivered {
                self.delegate.file_group_download_complete(&group);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Conflict decisions
    // ========================================================================

    /// Answers a pending decision
    ///
    /// The resolution is validated before anything changes. If its download
    /// group is then complete and undisputed it is delivered at once;
    /// otherwise a sync is requested for the sharing group so the remaining
    /// downloads and any unblocked uploads run on the next pass.
    ///
    /// # Errors
    /// `Conflict` if the decision is unknown or the resolution is invalid
    /// for it.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_conflict(
        &mut self,
        decision_id: DecisionId,
        resolution: ConflictResolution,
    ) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        let sharing_group_id = tx
            .decision(&decision_id)
            .map(|d| *d.sharing_group_id());
        let group_id = ConflictResolver::resolve(&mut tx, &decision_id, resolution, ResolutionSource::User)?;
        let delivered: Option<DeliveredGroup> = DownloadScanner::deliver(&mut tx, &group_id)?;

        if let Some(sharing_group_id) = sharing_group_id {
            let downloads_left = tx
                .download_groups
                .trackers()
                .iter()
                .any(|t| t.sharing_group_id == sharing_group_id && t.status() == DownloadStatus::NotStarted);
            let uploads_waiting = UploadQueueManager::next_batch(&tx, &sharing_group_id)
                .is_some_and(|b| !batch_blocked(&tx, b));
            if (downloads_left || uploads_waiting) && !tx.sync_requests.contains(&sharing_group_id) {
                tx.sync_requests.push_back(sharing_group_id);
            }
        }
        self.state = commit(tx, self.store.as_ref()).await?;

        if let Some(group) = delivered {
            self.delegate.file_group_download_complete(&group);
        }
        Ok(())
    }

    // ========================================================================
    // Sharing groups
    // ========================================================================

    /// Reads the sharing groups the server lists for this user
    ///
    /// Groups the server has moved ahead of are flagged `sync_needed`;
    /// groups no longer listed are marked removed.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_sharing_groups(&mut self) -> Result<Vec<SharingGroup>, SyncError> {
        let index = self
            .server
            .file_index(None)
            .await
            .context("FileIndex failed")
            .map_err(SyncError::Server)?;

        let mut tx = StateTransaction::begin(&self.state);
        for remote in &index.sharing_groups {
            if remote.deleted {
                if let Some(group) = tx.sharing_group_mut(&remote.sharing_group_id) {
                    group.mark_removed();
                }
                continue;
            }
            let group = tx
                .sharing_groups
                .entry(remote.sharing_group_id)
                .or_insert_with(|| SharingGroup::new(remote.sharing_group_id, remote.name.clone()));
            group.set_name(remote.name.clone());
            if remote.master_version > group.master_version() {
                group.mark_sync_needed();
            }
        }
        for (id, group) in tx.sharing_groups.iter_mut() {
            if !index.sharing_groups.iter().any(|g| &g.sharing_group_id == id) && !group.is_removed() {
                info!(sharing_group = %id, "No longer a member of sharing group");
                group.mark_removed();
            }
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        Ok(self.sharing_groups())
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_sharing_group(&mut self, name: Option<String>) -> Result<SharingGroupId, SyncError> {
        let sharing_group_id = SharingGroupId::new();
        self.server
            .create_sharing_group(&sharing_group_id, name.as_deref())
            .await
            .context("CreateSharingGroup failed")
            .map_err(SyncError::Server)?;

        let mut tx = StateTransaction::begin(&self.state);
        tx.sharing_groups
            .insert(sharing_group_id, SharingGroup::new(sharing_group_id, name));
        self.state = commit(tx, self.store.as_ref()).await?;
        info!(sharing_group = %sharing_group_id, "Sharing group created");
        Ok(sharing_group_id)
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_sharing_group(
        &mut self,
        sharing_group_id: SharingGroupId,
        name: Option<String>,
    ) -> Result<(), SyncError> {
        let server = Arc::clone(&self.server);
        let new_name = name.clone();
        self.with_master_version(sharing_group_id, "UpdateSharingGroup", move |expected| {
            let server = Arc::clone(&server);
            let name = new_name.clone();
            async move {
                server
                    .update_sharing_group(&sharing_group_id, name.as_deref(), expected)
                    .await
            }
        })
        .await?;

        let mut tx = StateTransaction::begin(&self.state);
        if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
            group.set_name(name);
        }
        self.state = commit(tx, self.store.as_ref()).await?;
        Ok(())
    }

    /// Deletes the sharing group on the server and forgets its queued work
    #[tracing::instrument(skip(self))]
    pub async fn remove_sharing_group(&mut self, sharing_group_id: SharingGroupId) -> Result<(), SyncError> {
        let server = Arc::clone(&self.server);
        self.with_master_version(sharing_group_id, "RemoveSharingGroup", move |expected| {
            let server = Arc::clone(&server);
            async move { server.remove_sharing_group(&sharing_group_id, expected).await }
        })
        .await?;
        self.mark_removed(&sharing_group_id).await
    }

    /// Leaves the sharing group and forgets its queued work
    #[tracing::instrument(skip(self))]
    pub async fn remove_user_from_sharing_group(&mut self, sharing_group_id: SharingGroupId) -> Result<(), SyncError> {
        let server = Arc::clone(&self.server);
        self.with_master_version(sharing_group_id, "RemoveUserFromSharingGroup", move |expected| {
            let server = Arc::clone(&server);
            async move { server.remove_user_from_sharing_group(&sharing_group_id, expected).await }
        })
        .await?;
        self.mark_removed(&sharing_group_id).await
    }

    /// Issues a master-versioned sharing group call
    ///
    /// On a conflict the server's value is adopted, the group is flagged
    /// `sync_needed` and the call is retried once.
    async fn with_master_version<F, Fut>(
        &mut self,
        sharing_group_id: SharingGroupId,
        operation: &str,
        call: F,
    ) -> Result<(), SyncError>
    where
        F: Fn(MasterVersion) -> Fut,
        Fut: Future<Output = anyhow::Result<ServerResponse<()>>>,
    {
        UploadQueueManager::check_sharing_group(&self.state, &sharing_group_id)?;
        let mut expected = self.master_version(&sharing_group_id)?;

        for _ in 0..2 {
            let response = call(expected)
                .await
                .with_context(|| format!("{} failed", operation))
                .map_err(SyncError::Server)?;
            match response {
                ServerResponse::Success(()) => {
                    let mut tx = StateTransaction::begin(&self.state);
                    if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
                        group.set_master_version(expected.next());
                    }
                    self.state = commit(tx, self.store.as_ref()).await?;
                    info!(sharing_group = %sharing_group_id, operation, "Sharing group updated");
                    return Ok(());
                }
                ServerResponse::Gone(reason) => {
                    warn!(sharing_group = %sharing_group_id, operation, %reason, "Sharing group gone");
                    self.mark_removed(&sharing_group_id).await?;
                    return Err(SyncError::SharingGroupRemoved(sharing_group_id));
                }
                ServerResponse::MasterVersionConflict { current } => {
                    debug!(
                        sharing_group = %sharing_group_id,
                        operation,
                        expected = expected.value(),
                        current = current.value(),
                        "Master version conflict, retrying"
                    );
                    let mut tx = StateTransaction::begin(&self.state);
                    if let Some(group) = tx.sharing_group_mut(&sharing_group_id) {
                        group.set_master_version(current);
                        group.mark_sync_needed();
                    }
                    self.state = commit(tx, self.store.as_ref()).await?;
                    expected = current;
                }
            }
        }

        Err(SyncError::MasterVersionRetriesExhausted {
            sharing_group: sharing_group_id,
            retries: 1,
        })
    }

    // ========================================================================
    // Invitations
    // ========================================================================

    /// Returns the invitation code
    pub async fn create_sharing_invitation(
        &self,
        sharing_group_id: SharingGroupId,
        permission: Permission,
        allow_social_acceptance: bool,
        number_of_acceptors: u32,
    ) -> Result<String, SyncError> {
        UploadQueueManager::check_sharing_group(&self.state, &sharing_group_id)?;
        self.server
            .create_sharing_invitation(&sharing_group_id, permission, allow_social_acceptance, number_of_acceptors)
            .await
            .context("CreateSharingInvitation failed")
            .map_err(SyncError::Server)
    }

    /// Joins the sharing group behind an invitation code
    ///
    /// The group is registered locally and flagged `sync_needed`.
    #[tracing::instrument(skip(self))]
    pub async fn redeem_sharing_invitation(&mut self, code: &str) -> Result<SharingGroupId, SyncError> {
        let redeemed = self
            .server
            .redeem_sharing_invitation(code)
            .await
            .context("RedeemSharingInvitation failed")
            .map_err(SyncError::Server)?;
        let sharing_group_id = redeemed.sharing_group_id;

        let mut tx = StateTransaction::begin(&self.state);
        let rejoined = tx
            .sharing_group(&sharing_group_id)
            .is_some_and(SharingGroup::is_removed);
        if rejoined {
            tx.sharing_groups.remove(&sharing_group_id);
        }
        let group = tx
            .sharing_groups
            .entry(sharing_group_id)
            .or_insert_with(|| SharingGroup::new(sharing_group_id, redeemed.name.clone()));
        group.set_name(redeemed.name);
        group.mark_sync_needed();
        self.state = commit(tx, self.store.as_ref()).await?;
        info!(sharing_group = %sharing_group_id, "Sharing invitation redeemed");
        Ok(sharing_group_id)
    }

    pub async fn get_sharing_invitation_info(&self, code: &str) -> Result<InvitationInfo, SyncError> {
        self.server
            .get_sharing_invitation_info(code)
            .await
            .context("GetSharingInvitationInfo failed")
            .map_err(SyncError::Server)
    }

    // ========================================================================
    // Reset
    // ========================================================================

    /// Forgets every file, queue, download, decision and cached result
    ///
    /// Sharing groups are kept; their files are rediscovered on the next sync.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&mut self) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        tx.directory.clear();
        tx.upload_queues = UploadQueues::default();
        tx.download_groups.clear();
        tx.decisions.clear();
        tx.network_cache.clear();
        tx.sync_requests.clear();
        self.state = commit(tx, self.store.as_ref()).await?;
        self.scheduler.take_requests();
        info!("Sync state reset");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn master_version(&self, sharing_group_id: &SharingGroupId) -> Result<MasterVersion, SyncError> {
        self.state
            .sharing_group(sharing_group_id)
            .map(SharingGroup::master_version)
            .ok_or(SyncError::UnknownSharingGroup(*sharing_group_id))
    }

    fn note_conflict(
        &self,
        sharing_group_id: &SharingGroupId,
        retries: &mut u32,
        current: MasterVersion,
    ) -> Result<(), SyncError> {
        *retries += 1;
        info!(
            sharing_group = %sharing_group_id,
            current = current.value(),
            attempt = *retries,
            "Master version conflict"
        );
        if *retries > self.settings.max_master_version_retries {
            return Err(SyncError::MasterVersionRetriesExhausted {
                sharing_group: *sharing_group_id,
                retries: self.settings.max_master_version_retries,
            });
        }
        Ok(())
    }

    async fn mark_removed(&mut self, sharing_group_id: &SharingGroupId) -> Result<(), SyncError> {
        let mut tx = StateTransaction::begin(&self.state);
        if let Some(group) = tx.sharing_group_mut(sharing_group_id) {
            group.mark_removed();
        }
        forget_sharing_group(&mut tx, sharing_group_id);
        self.state = commit(tx, self.store.as_ref()).await?;
        info!(sharing_group = %sharing_group_id, "Sharing group marked removed");
        Ok(())
    }
}

/// True if an open decision covers a file of the batch
fn batch_blocked(state: &SyncState, batch: &UploadQueue) -> bool {
    batch
        .trackers
        .iter()
        .any(|t| state.has_decision_for_file(&t.file_uuid))
}

/// Drops queued uploads, downloads, decisions and requests of a sharing group
fn forget_sharing_group(state: &mut SyncState, sharing_group_id: &SharingGroupId) {
    if state
        .upload_queues
        .pending
        .as_ref()
        .is_some_and(|q| q.sharing_group_id() == sharing_group_id)
    {
        state.upload_queues.pending = None;
    }
    state
        .upload_queues
        .synced
        .retain(|q| q.sharing_group_id() != sharing_group_id);
    DownloadScanner::discard(state, sharing_group_id);
    state.sync_requests.retain(|id| id != sharing_group_id);
}
