//! Integration tests for the download side of a sync pass
//!
//! Another client's changes are placed directly on the fake server; the
//! client under test discovers them through the file index.

use groupsync_core::domain::{DownloadKind, FileGroupUuid, FileUuid, GoneReason};

use crate::common::{self, Event, FakeServer};

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_file_group_is_delivered_in_one_callback() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Album");
    let album = FileGroupUuid::new();
    let files: Vec<FileUuid> = (0..10).map(|_| FileUuid::new()).collect();
    for (i, file) in files.iter().enumerate() {
        server.other_client_upload(&sg, *file, Some(album), format!("photo {}", i).as_bytes());
    }

    let mut c = common::client(&server).await;
    let groups = c.sync.refresh_sharing_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert!(groups[0].sync_needed());

    c.sync.sync(sg).await.unwrap();

    let delivered = c.delegate.delivered_groups();
    assert_eq!(delivered.len(), 1);
    let group = &delivered[0];
    assert_eq!(group.file_group_uuid, Some(album));
    assert_eq!(group.files.len(), 10);
    for file in &group.files {
        assert_eq!(file.kind, DownloadKind::Content);
        let path = file.local_path.as_ref().expect("downloaded content");
        let index = files.iter().position(|f| f == &file.file_uuid).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), format!("photo {}", index).as_bytes());
    }
    assert!(c.delegate.events().contains(&Event::WillStartDownloads(10)));
    assert_eq!(server.calls().download_file, 10);

    for file in &files {
        let entry = c.sync.directory_entry(file).unwrap();
        assert_eq!(entry.file_version(), Some(0));
        assert_eq!(entry.file_group_uuid(), Some(&album));
    }
    assert!(!c.sync.state().sharing_group(&sg).unwrap().sync_needed());
}

#[tokio::test]
async fn test_files_without_group_are_delivered_alone() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Notes");
    for i in 0..3 {
        server.other_client_upload(&sg, FileUuid::new(), None, format!("note {}", i).as_bytes());
    }

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    let delivered = c.delegate.delivered_groups();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|g| g.files.len() == 1 && g.file_group_uuid.is_none()));
}

#[tokio::test]
async fn test_second_sync_without_changes_downloads_nothing() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Notes");
    server.other_client_upload(&sg, FileUuid::new(), None, b"once");

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();
    c.delegate.clear();
    c.sync.sync(sg).await.unwrap();

    assert_eq!(server.calls().download_file, 1);
    assert_eq!(c.delegate.events(), vec![Event::SyncStarted(sg), Event::SyncDone(sg)]);
}

#[tokio::test]
async fn test_newer_version_replaces_local_copy() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"first");

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    server.other_client_upload(&sg, file, None, b"second");
    c.sync.sync(sg).await.unwrap();

    let delivered = c.delegate.delivered_groups();
    assert_eq!(delivered.len(), 2);
    let latest = &delivered[1].files[0];
    assert_eq!(latest.file_version, 1);
    assert_eq!(std::fs::read(latest.local_path.as_ref().unwrap()).unwrap(), b"second");
    assert_eq!(c.sync.directory_entry(&file).unwrap().file_version(), Some(1));
}

#[tokio::test]
async fn test_metadata_only_change_fetches_metadata() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"body");

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    server.other_client_upload_meta(&sg, &file, r#"{"starred":true}"#);
    c.sync.sync(sg).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.download_file, 1);
    assert_eq!(calls.download_app_meta_data, 1);

    let delivered = c.delegate.delivered_groups();
    let update = &delivered[1].files[0];
    assert_eq!(update.kind, DownloadKind::AppMetaDataOnly);
    assert_eq!(update.app_meta_data.as_deref(), Some(r#"{"starred":true}"#));
    assert!(update.local_path.is_none());

    let entry = c.sync.directory_entry(&file).unwrap();
    assert_eq!(entry.app_meta_data(), Some(r#"{"starred":true}"#));
    assert_eq!(entry.app_meta_data_version(), Some(0));
    assert_eq!(entry.file_version(), Some(0));
}

// ============================================================================
// Deletions and gone files
// ============================================================================

#[tokio::test]
async fn test_remote_deletion_of_known_file_is_applied() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"short lived");

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    server.other_client_delete(&sg, &file);
    c.sync.sync(sg).await.unwrap();

    let delivered = c.delegate.delivered_groups();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].files[0].kind, DownloadKind::Deletion);
    assert!(c.sync.directory_entry(&file).unwrap().is_deleted_locally());
    // deletions carry no content
    assert_eq!(server.calls().download_file, 1);
}

#[tokio::test]
async fn test_deletion_of_unknown_file_is_absorbed() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"never seen");
    server.other_client_delete(&sg, &file);

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert!(c.delegate.delivered_groups().is_empty());
    assert!(c.sync.directory_entry(&file).is_none());
    assert_eq!(c.delegate.events(), vec![Event::SyncStarted(sg), Event::SyncDone(sg)]);
}

#[tokio::test]
async fn test_gone_download_is_delivered_with_reason() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let file = FileUuid::new();
    server.other_client_upload(&sg, file, None, b"lost");
    server.mark_gone(&sg, &file, GoneReason::UserRemoved);

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert!(c
        .delegate
        .events()
        .contains(&Event::FileGone(file, GoneReason::UserRemoved)));
    let delivered = c.delegate.delivered_groups();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].files[0].gone_reason, Some(GoneReason::UserRemoved));
    assert_eq!(
        c.sync.directory_entry(&file).unwrap().gone_reason(),
        Some(GoneReason::UserRemoved)
    );

    // the recorded reason keeps the file from being planned again
    c.sync.sync(sg).await.unwrap();
    assert_eq!(server.calls().download_file, 1);
    assert_eq!(c.delegate.delivered_groups().len(), 1);
}

// ============================================================================
// Master version moves
// ============================================================================

#[tokio::test]
async fn test_batch_elsewhere_during_downloads_delivers_each_group_once() {
    let server = FakeServer::new();
    let sg = server.other_client_create_group("Docs");
    let first = FileUuid::new();
    let second = FileUuid::new();
    server.other_client_upload(&sg, first, None, b"one");
    server.other_client_upload(&sg, second, None, b"two");

    let mut c = common::client(&server).await;
    c.sync.refresh_sharing_groups().await.unwrap();

    let other = server.clone();
    c.delegate
        .on("will_start_downloads", move || other.bump_master_version(&sg));
    c.sync.sync(sg).await.unwrap();

    let delivered = c.delegate.delivered_groups();
    let mut files: Vec<FileUuid> = delivered.iter().map(|g| g.files[0].file_uuid).collect();
    files.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(files, expected);

    // one attempt was refused with the stale master version
    assert_eq!(server.calls().download_file, 3);
    assert_eq!(
        c.sync.state().sharing_group(&sg).unwrap().master_version(),
        server.master_version(&sg)
    );
    assert!(c.sync.state().download_groups.is_empty());
    assert_eq!(c.delegate.events().last(), Some(&Event::SyncDone(sg)));
}
