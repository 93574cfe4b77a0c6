//! Integration tests for the sync lifecycle
//!
//! Stopping and resuming, crash recovery against a SQLite-backed store,
//! request ordering, sharing group management, invitations and reset.

use std::sync::Arc;

use tempfile::TempDir;

use groupsync_cache::DatabasePool;
use groupsync_core::config::ConfigBuilder;
use groupsync_core::domain::{DownloadStatus, FileUuid, MasterVersion, SyncState, UploadStatus};
use groupsync_core::ports::{IStateStore, InvitationInfo, NoopDelegate, Permission};
use groupsync_sync::{ContentUpload, SyncError, SyncOrchestrator, SyncPhase};

use crate::common::{self, CrashingStore, Event, FakeServer, RecordingDelegate};

async fn sqlite_store(dir: &TempDir) -> Arc<dyn IStateStore> {
    let pool = DatabasePool::from_config(&common::config_for(dir))
        .await
        .expect("Failed to open database");
    Arc::new(pool.state_store())
}

fn has_uploaded_tracker(state: &SyncState) -> bool {
    state
        .upload_queues
        .synced
        .iter()
        .flat_map(|q| q.trackers.iter())
        .any(|t| t.status() == UploadStatus::Uploaded)
}

fn has_downloaded_tracker(state: &SyncState) -> bool {
    state
        .download_groups
        .trackers()
        .iter()
        .any(|t| t.status() == DownloadStatus::Downloaded)
}

// ============================================================================
// Stop and resume
// ============================================================================

#[tokio::test]
async fn test_stop_between_uploads_then_resume() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let first = FileUuid::new();
    let second = FileUuid::new();
    let upload = c.content(sg, first, b"first");
    c.sync.enqueue(upload).await.unwrap();
    let upload = c.content(sg, second, b"second");
    c.sync.enqueue(upload).await.unwrap();

    let handle = c.sync.scheduler();
    c.delegate
        .on("single_file_upload_complete", move || handle.request_stop());
    c.sync.sync(sg).await.unwrap();

    assert_eq!(c.delegate.events().last(), Some(&Event::SyncStopping(sg)));
    assert_eq!(server.calls().upload_file, 1);
    assert_eq!(server.calls().done_uploads, 0);
    assert_eq!(c.sync.pending_upload_count(), 1);
    assert_eq!(c.sync.phase(), SyncPhase::Idle);
    assert!(!c.sync.scheduler().is_active());
    assert!(c.sync.state().sync_requests.contains(&sg));

    c.sync.sync(sg).await.unwrap();

    assert_eq!(c.delegate.events().last(), Some(&Event::SyncDone(sg)));
    assert_eq!(server.calls().upload_file, 2);
    assert_eq!(server.calls().done_uploads, 1);
    assert!(server.file(&sg, &first).is_some());
    assert!(server.file(&sg, &second).is_some());
    assert_eq!(server.master_version(&sg), MasterVersion::new(1));
}

// ============================================================================
// Crash recovery
// ============================================================================

#[tokio::test]
async fn test_cached_upload_is_replayed_after_crash() {
    common::init_tracing();
    let server = FakeServer::new();
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new()
        .sync_download_dir(dir.path().join("downloads"))
        .transfer_background_threshold_bytes(0)
        .build();
    let durable = sqlite_store(&dir).await;
    let file = FileUuid::new();
    let path = dir.path().join("report.pdf");
    std::fs::write(&path, b"quarterly numbers").unwrap();

    let crashing = Arc::new(CrashingStore::new(durable.clone(), has_uploaded_tracker));
    let mut before = SyncOrchestrator::open(
        server.clone(),
        crashing,
        Arc::new(RecordingDelegate::default()),
        &config,
    )
    .await
    .unwrap();
    let sg = before.create_sharing_group(None).await.unwrap();
    before.enqueue(ContentUpload::new(file, sg, &path)).await.unwrap();

    let crashed = before.sync(sg).await;
    assert!(matches!(crashed, Err(SyncError::Storage(_))));
    drop(before);
    assert_eq!(server.calls().upload_file, 1);

    let delegate = Arc::new(RecordingDelegate::default());
    let mut after = SyncOrchestrator::open(server.clone(), durable.clone(), delegate.clone(), &config)
        .await
        .unwrap();
    assert_eq!(after.pending_upload_count(), 0);

    after.sync(sg).await.unwrap();

    assert_eq!(server.calls().upload_file, 1);
    assert_eq!(server.calls().done_uploads, 1);
    assert_eq!(server.file(&sg, &file).unwrap().contents, b"quarterly numbers");
    assert_eq!(after.directory_entry(&file).unwrap().file_version(), Some(0));
    assert!(after.state().network_cache.is_empty());
    assert_eq!(delegate.events().last(), Some(&Event::SyncDone(sg)));
}

#[tokio::test]
async fn test_uncached_upload_is_sent_again_after_crash() {
    common::init_tracing();
    let server = FakeServer::new();
    let dir = TempDir::new().unwrap();
    let config = common::config_for(&dir);
    let durable = sqlite_store(&dir).await;
    let file = FileUuid::new();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, b"small").unwrap();

    let crashing = Arc::new(CrashingStore::new(durable.clone(), has_uploaded_tracker));
    let mut before = SyncOrchestrator::open(server.clone(), crashing, Arc::new(NoopDelegate), &config)
        .await
        .unwrap();
    let sg = before.create_sharing_group(None).await.unwrap();
    before.enqueue(ContentUpload::new(file, sg, &path)).await.unwrap();
    assert!(before.sync(sg).await.is_err());
    drop(before);

    let mut after = SyncOrchestrator::open(server.clone(), durable, Arc::new(NoopDelegate), &config)
        .await
        .unwrap();
    assert_eq!(after.pending_upload_count(), 1);

    after.sync(sg).await.unwrap();

    assert_eq!(server.calls().upload_file, 2);
    assert_eq!(server.calls().done_uploads, 1);
    assert_eq!(server.file(&sg, &file).unwrap().version, 0);
}

#[tokio::test]
async fn test_cached_download_is_replayed_after_crash() {
    common::init_tracing();
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Shared");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"fetched once");

    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new()
        .sync_download_dir(dir.path().join("downloads"))
        .transfer_background_threshold_bytes(0)
        .build();
    let durable = sqlite_store(&dir).await;

    let crashing = Arc::new(CrashingStore::new(durable.clone(), has_downloaded_tracker));
    let mut before = SyncOrchestrator::open(server.clone(), crashing, Arc::new(NoopDelegate), &config)
        .await
        .unwrap();
    before.refresh_sharing_groups().await.unwrap();
    assert!(matches!(before.sync(sg).await, Err(SyncError::Storage(_))));
    drop(before);
    assert_eq!(server.calls().download_file, 1);

    let delegate = Arc::new(RecordingDelegate::default());
    let mut after = SyncOrchestrator::open(server.clone(), durable, delegate.clone(), &config)
        .await
        .unwrap();
    after.sync(sg).await.unwrap();

    assert_eq!(server.calls().download_file, 1);
    let delivered = delegate.delivered_groups();
    assert_eq!(delivered.len(), 1);
    let path = delivered[0].files[0].local_path.as_ref().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"fetched once");
    assert_eq!(after.directory_entry(&file).unwrap().file_version(), Some(0));
}

#[tokio::test]
async fn test_batch_applied_before_crash_is_not_mistaken_for_remote_change() {
    common::init_tracing();
    let server = FakeServer::new();
    let dir = TempDir::new().unwrap();
    let config = common::config_for(&dir);
    let durable = sqlite_store(&dir).await;
    let file = FileUuid::new();
    let path = dir.path().join("minutes.txt");
    std::fs::write(&path, b"agreed").unwrap();

    // fails the commit that records the finished batch
    let crashing = Arc::new(CrashingStore::new(durable.clone(), move |s: &SyncState| {
        s.upload_queues.pending.is_none()
            && s.upload_queues.synced.is_empty()
            && s.directory.get(&file).is_some()
    }));
    let mut before = SyncOrchestrator::open(server.clone(), crashing, Arc::new(NoopDelegate), &config)
        .await
        .unwrap();
    let sg = before.create_sharing_group(None).await.unwrap();
    before
        .enqueue(ContentUpload::new(file, sg, &path).with_app_meta_data("{}"))
        .await
        .unwrap();
    assert!(matches!(before.sync(sg).await, Err(SyncError::Storage(_))));
    drop(before);
    assert_eq!(server.master_version(&sg), MasterVersion::new(1));

    let delegate = Arc::new(RecordingDelegate::default());
    let mut after = SyncOrchestrator::open(server.clone(), durable, delegate.clone(), &config)
        .await
        .unwrap();
    assert_eq!(
        after.state().upload_queues.synced[0].done_uploads_sent(),
        Some(MasterVersion::new(0))
    );

    after.sync(sg).await.unwrap();

    assert!(after.pending_decisions().is_empty());
    assert!(after.state().upload_queues.synced.is_empty());
    let entry = after.directory_entry(&file).unwrap();
    assert_eq!(entry.file_version(), Some(0));
    assert_eq!(entry.app_meta_data_version(), Some(0));
    assert_eq!(
        after.state().sharing_group(&sg).unwrap().master_version(),
        MasterVersion::new(1)
    );

    let calls = server.calls();
    assert_eq!(calls.upload_file, 1);
    assert_eq!(calls.done_uploads, 1);
    assert_eq!(calls.download_file, 0);
    assert_eq!(
        delegate.events(),
        vec![
            Event::SyncStarted(sg),
            Event::ContentUploadsCompleted(1),
            Event::SyncDone(sg),
        ]
    );
}

#[tokio::test]
async fn test_unanswered_done_uploads_is_sent_again() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();
    let upload = c.content(sg, file, b"retry me");
    c.sync.enqueue(upload).await.unwrap();
    server.fail_next("done_uploads");

    assert!(matches!(c.sync.sync(sg).await, Err(SyncError::Server(_))));
    assert_eq!(server.master_version(&sg), MasterVersion::new(0));
    assert_eq!(
        c.sync.state().upload_queues.synced[0].done_uploads_sent(),
        Some(MasterVersion::new(0))
    );

    c.sync.sync(sg).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.upload_file, 1);
    assert_eq!(calls.done_uploads, 2);
    assert_eq!(server.file(&sg, &file).unwrap().contents, b"retry me");
    assert_eq!(c.sync.directory_entry(&file).unwrap().file_version(), Some(0));
    assert!(c.sync.state().upload_queues.synced.is_empty());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    common::upload_and_sync(&mut c, sg, b"kept").await;
    let upload = c.content(sg, FileUuid::new(), b"queued");
    c.sync.enqueue(upload).await.unwrap();

    let reopened = SyncOrchestrator::open(server.clone(), c.store.clone(), Arc::new(NoopDelegate), &c.config())
        .await
        .unwrap();

    assert_eq!(reopened.state(), c.sync.state());
    assert_eq!(reopened.pending_upload_count(), 1);
}

// ============================================================================
// Request ordering
// ============================================================================

#[tokio::test]
async fn test_request_during_pass_runs_after_it() {
    let server = FakeServer::new();
    let (mut c, family) = common::client_with_group(&server).await;
    let work = c.sync.create_sharing_group(Some("Work".into())).await.unwrap();

    let handle = c.sync.scheduler();
    c.delegate.on("sync_started", move || {
        handle.request_sync(work);
    });
    c.sync.sync(family).await.unwrap();

    assert_eq!(
        c.delegate.events(),
        vec![
            Event::SyncStarted(family),
            Event::SyncDone(family),
            Event::SyncDelayed(work),
            Event::SyncStarted(work),
            Event::SyncDone(work),
        ]
    );
    assert!(c.sync.state().sync_requests.is_empty());
}

// ============================================================================
// Sharing groups
// ============================================================================

#[tokio::test]
async fn test_update_adopts_newer_master_version() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    server.bump_master_version(&sg);

    c.sync
        .update_sharing_group(sg, Some("Renamed".into()))
        .await
        .unwrap();

    assert_eq!(server.group_name(&sg).as_deref(), Some("Renamed"));
    let group = c.sync.state().sharing_group(&sg).unwrap();
    assert_eq!(group.name(), Some("Renamed"));
    assert_eq!(group.master_version(), server.master_version(&sg));
    assert!(group.sync_needed());
}

#[tokio::test]
async fn test_leaving_a_group_blocks_further_work() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;

    c.sync.remove_user_from_sharing_group(sg).await.unwrap();

    assert!(c.sync.state().sharing_group(&sg).unwrap().is_removed());
    assert!(matches!(c.sync.sync(sg).await, Err(SyncError::SharingGroupRemoved(_))));
    let upload = c.content(sg, FileUuid::new(), b"late");
    assert!(matches!(c.sync.enqueue(upload).await, Err(SyncError::SharingGroupRemoved(_))));
}

#[tokio::test]
async fn test_removing_a_group_drops_its_queued_uploads() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let upload = c.content(sg, FileUuid::new(), b"never sent");
    c.sync.enqueue(upload).await.unwrap();

    c.sync.remove_sharing_group(sg).await.unwrap();

    assert!(server.is_group_deleted(&sg));
    assert_eq!(c.sync.pending_upload_count(), 0);
    assert!(c.sync.state().upload_queues.pending.is_none());
    assert_eq!(server.calls().upload_file, 0);
}

#[tokio::test]
async fn test_group_removed_elsewhere_fails_the_pass() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    server.other_client_remove_group(&sg);

    let result = c.sync.sync(sg).await;

    assert!(matches!(result, Err(SyncError::SharingGroupRemoved(id)) if id == sg));
    assert!(c.sync.state().sharing_group(&sg).unwrap().is_removed());
    assert!(c
        .delegate
        .events()
        .iter()
        .any(|e| matches!(e, Event::ServerError(_))));
    assert!(c.sync.state().sync_requests.is_empty());
}

#[tokio::test]
async fn test_refresh_learns_and_forgets_groups() {
    let server = FakeServer::new();
    let work = server.other_client_create_group("Work");
    server.other_client_upload(&work, FileUuid::new(), None, b"agenda");
    let mut c = common::client(&server).await;

    let groups = c.sync.refresh_sharing_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name(), Some("Work"));
    assert!(groups[0].sync_needed());

    c.sync.sync(work).await.unwrap();
    assert!(!c.sync.state().sharing_group(&work).unwrap().sync_needed());

    server.other_client_remove_group(&work);
    let groups = c.sync.refresh_sharing_groups().await.unwrap();
    assert!(groups[0].is_removed());
}

// ============================================================================
// Invitations
// ============================================================================

#[tokio::test]
async fn test_invitation_brings_in_a_second_client() {
    let server = FakeServer::new();
    let (mut alice, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut alice, sg, b"welcome").await;

    let code = alice
        .sync
        .create_sharing_invitation(sg, Permission::Write, true, 1)
        .await
        .unwrap();

    let mut bob = common::client(&server).await;
    let info = bob.sync.get_sharing_invitation_info(&code).await.unwrap();
    assert_eq!(
        info,
        InvitationInfo {
            permission: Permission::Write,
            allow_social_acceptance: true,
        }
    );

    let joined = bob.sync.redeem_sharing_invitation(&code).await.unwrap();
    assert_eq!(joined, sg);
    let group = bob.sync.state().sharing_group(&sg).unwrap();
    assert_eq!(group.name(), Some("Family"));
    assert!(group.sync_needed());

    bob.sync.sync(sg).await.unwrap();
    let delivered = bob.delegate.delivered_groups();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].files[0].file_uuid, file);
}

// ============================================================================
// Reset
// ============================================================================

#[tokio::test]
async fn test_reset_forgets_files_and_downloads_them_again() {
    let server = FakeServer::new();
    let (mut alice, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut alice, sg, b"again").await;

    let mut bob = common::client(&server).await;
    bob.sync.refresh_sharing_groups().await.unwrap();
    bob.sync.sync(sg).await.unwrap();
    assert!(bob.sync.directory_entry(&file).is_some());

    bob.sync.reset().await.unwrap();
    assert!(bob.sync.directory_entry(&file).is_none());
    assert_eq!(bob.sync.sharing_groups().len(), 1);

    bob.sync.sync(sg).await.unwrap();
    assert_eq!(bob.delegate.delivered_groups().len(), 2);
    assert_eq!(server.calls().download_file, 2);
    assert_eq!(bob.sync.directory_entry(&file).unwrap().file_version(), Some(0));
}
