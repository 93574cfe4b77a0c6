//! Integration tests for the upload side of a sync pass
//!
//! Covers batching, version numbering, deletions and how the pass behaves
//! when the server's master version moves or the transport fails.

use groupsync_core::domain::{FileUuid, GoneReason, MasterVersion};
use groupsync_sync::{AppMetaDataUpload, ContentUpload, SyncError, UploadChange};

use crate::common::{self, Event, FakeServer};

// ============================================================================
// Content uploads
// ============================================================================

#[tokio::test]
async fn test_first_upload_reaches_server_and_reports_events_in_order() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;

    let file = common::upload_and_sync(&mut c, sg, b"hello").await;

    let stored = server.file(&sg, &file).expect("file on server");
    assert_eq!(stored.version, 0);
    assert_eq!(stored.contents, b"hello");
    assert_eq!(stored.mime_type.as_deref(), Some("text/plain"));

    assert_eq!(
        c.delegate.events(),
        vec![
            Event::SyncStarted(sg),
            Event::WillStartUploads {
                content: 1,
                deletions: 0
            },
            Event::SingleFileUploadComplete(file),
            Event::ContentUploadsCompleted(1),
            Event::SyncDone(sg),
        ]
    );

    let entry = c.sync.directory_entry(&file).unwrap();
    assert_eq!(entry.file_version(), Some(0));
    assert_eq!(c.sync.pending_upload_count(), 0);
}

#[tokio::test]
async fn test_replaced_content_sends_only_latest_bytes() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    c.sync.enqueue(c.content(sg, file, b"draft")).await.unwrap();
    c.sync.enqueue(c.content(sg, file, b"final version")).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert_eq!(server.calls().upload_file, 1);
    assert_eq!(server.file(&sg, &file).unwrap().contents, b"final version");
}

#[tokio::test]
async fn test_metadata_queued_after_content_rides_on_the_same_upload() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    c.sync.enqueue(c.content(sg, file, b"photo")).await.unwrap();
    c.sync
        .enqueue(AppMetaDataUpload::new(file, sg, r#"{"title":"beach"}"#))
        .await
        .unwrap();
    c.sync.sync(sg).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.upload_file, 1);
    assert_eq!(calls.upload_app_meta_data, 0);
    assert_eq!(
        server.file(&sg, &file).unwrap().app_meta_data,
        Some((r#"{"title":"beach"}"#.to_string(), 0))
    );
    let entry = c.sync.directory_entry(&file).unwrap();
    assert_eq!(entry.app_meta_data(), Some(r#"{"title":"beach"}"#));
    assert_eq!(entry.app_meta_data_version(), Some(0));
}

#[tokio::test]
async fn test_metadata_update_of_existing_file() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"doc").await;

    c.sync.enqueue(AppMetaDataUpload::new(file, sg, "v0")).await.unwrap();
    c.sync.sync(sg).await.unwrap();
    c.sync.enqueue(AppMetaDataUpload::new(file, sg, "v1")).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert_eq!(server.calls().upload_app_meta_data, 2);
    assert_eq!(server.file(&sg, &file).unwrap().app_meta_data, Some(("v1".to_string(), 1)));
    assert_eq!(server.file(&sg, &file).unwrap().version, 0);
}

#[tokio::test]
async fn test_metadata_cannot_create_a_file() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    let result = c.sync.enqueue(AppMetaDataUpload::new(file, sg, "{}")).await;

    assert!(matches!(result, Err(SyncError::CannotVersionZeroViaMetadataUpload(f)) if f == file));
    assert_eq!(c.sync.pending_upload_count(), 0);
}

#[tokio::test]
async fn test_explicit_version_must_be_next() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"v0").await;

    let path = c.write("skip", b"v5");
    let result = c
        .sync
        .enqueue(ContentUpload::new(file, sg, path.clone()).with_version(5))
        .await;
    assert!(matches!(
        result,
        Err(SyncError::NonConsecutiveVersion {
            expected: 1,
            actual: 5,
            ..
        })
    ));

    c.sync
        .enqueue(ContentUpload::new(file, sg, path).with_version(1))
        .await
        .unwrap();
    c.sync.sync(sg).await.unwrap();
    assert_eq!(server.file(&sg, &file).unwrap().version, 1);
}

#[tokio::test]
async fn test_mime_type_is_fixed_by_first_upload() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"text").await;

    let path = c.write("image", b"png");
    let result = c
        .sync
        .enqueue(ContentUpload::new(file, sg, path).with_mime_type("image/png"))
        .await;

    assert!(matches!(result, Err(SyncError::MimeTypeMismatch { .. })));
}

#[tokio::test]
async fn test_master_version_counts_completed_batches() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;

    for contents in [b"one".as_slice(), b"two", b"three"] {
        common::upload_and_sync(&mut c, sg, contents).await;
    }

    assert_eq!(server.master_version(&sg), MasterVersion::new(3));
    let local = c.sync.state().sharing_group(&sg).unwrap().master_version();
    assert_eq!(local, MasterVersion::new(3));
    assert_eq!(server.calls().done_uploads, 3);
}

// ============================================================================
// Deletions
// ============================================================================

#[tokio::test]
async fn test_upload_deletion() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"bye").await;
    c.delegate.clear();

    c.sync.enqueue(UploadChange::deletion(file, sg)).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert_eq!(server.calls().upload_deletion, 1);
    assert!(server.file(&sg, &file).unwrap().deleted);
    assert!(c.sync.directory_entry(&file).unwrap().is_deleted_locally());
    assert!(c
        .delegate
        .events()
        .contains(&Event::WillStartUploads { content: 0, deletions: 1 }));
    assert!(c.delegate.events().contains(&Event::UploadDeletionsCompleted(1)));

    let again = c.sync.enqueue(c.content(sg, file, b"back")).await;
    assert!(matches!(again, Err(SyncError::FileQueuedForDeletion(f)) if f == file));
}

#[tokio::test]
async fn test_deleting_a_never_uploaded_file_settles_locally() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    c.sync.enqueue(c.content(sg, file, b"oops")).await.unwrap();
    c.sync.enqueue(UploadChange::deletion(file, sg)).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.upload_file, 0);
    assert_eq!(calls.upload_deletion, 0);
    assert_eq!(calls.done_uploads, 0);
    assert!(server.file(&sg, &file).is_none());
    assert!(c.sync.directory_entry(&file).unwrap().is_deleted_locally());
    assert!(c.delegate.events().contains(&Event::SyncDone(sg)));
}

// ============================================================================
// Master version moves and failures
// ============================================================================

#[tokio::test]
async fn test_concurrent_batch_elsewhere_is_absorbed() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    let other = server.clone();
    c.delegate
        .on("will_start_uploads", move || other.bump_master_version(&sg));

    c.sync.enqueue(c.content(sg, file, b"racing")).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    assert_eq!(server.file(&sg, &file).unwrap().version, 0);
    assert_eq!(server.calls().upload_file, 2);
    assert_eq!(server.master_version(&sg), MasterVersion::new(2));
    assert_eq!(
        c.sync.state().sharing_group(&sg).unwrap().master_version(),
        MasterVersion::new(2)
    );

    let events = c.delegate.events();
    assert_eq!(events.last(), Some(&Event::SyncDone(sg)));
    assert!(!events.iter().any(|e| matches!(e, Event::ServerError(_))));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::WillStartUploads { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_new_version_is_uploaded_while_master_version_moves() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"v0").await;
    c.delegate.clear();

    let other = server.clone();
    c.delegate
        .on("will_start_uploads", move || other.bump_master_version(&sg));

    c.sync.enqueue(c.content(sg, file, b"v1")).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    let stored = server.file(&sg, &file).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.contents, b"v1");
    assert_eq!(c.sync.directory_entry(&file).unwrap().file_version(), Some(1));

    // one stale attempt and one accepted attempt for v1
    assert_eq!(server.calls().upload_file, 3);
    assert_eq!(server.calls().done_uploads, 2);
    assert_eq!(server.calls().download_file, 0);
    assert_eq!(server.master_version(&sg), MasterVersion::new(3));
    assert_eq!(
        c.sync.state().sharing_group(&sg).unwrap().master_version(),
        MasterVersion::new(3)
    );
    assert_eq!(c.sync.pending_upload_count(), 0);

    let events = c.delegate.events();
    assert_eq!(events.last(), Some(&Event::SyncDone(sg)));
    assert!(events.contains(&Event::ContentUploadsCompleted(1)));
    assert!(!events.iter().any(|e| matches!(e, Event::ServerError(_) | Event::ContentConflict(_))));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = FakeServer::new();
    let mut c = common::client_with(&server, |b| b.sync_max_master_version_retries(0)).await;
    let sg = c.sync.create_sharing_group(None).await.unwrap();

    let other = server.clone();
    c.delegate
        .on("will_start_uploads", move || other.bump_master_version(&sg));
    c.sync.enqueue(c.content(sg, FileUuid::new(), b"x")).await.unwrap();
    let result = c.sync.sync(sg).await;

    assert!(matches!(
        result,
        Err(SyncError::MasterVersionRetriesExhausted { retries: 0, .. })
    ));
    assert!(c
        .delegate
        .events()
        .iter()
        .any(|e| matches!(e, Event::ServerError(_))));
}

#[tokio::test]
async fn test_transport_failure_halts_and_resumes() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = FileUuid::new();

    c.sync.enqueue(c.content(sg, file, b"flaky")).await.unwrap();
    server.fail_next("upload_file");

    let result = c.sync.sync(sg).await;
    assert!(matches!(result, Err(SyncError::Server(_))));
    assert!(server.file(&sg, &file).is_none());
    assert!(c
        .delegate
        .events()
        .iter()
        .any(|e| matches!(e, Event::ServerError(_))));
    assert_eq!(c.sync.pending_upload_count(), 1);

    c.sync.sync(sg).await.unwrap();
    assert_eq!(server.file(&sg, &file).unwrap().contents, b"flaky");
    assert_eq!(server.calls().upload_file, 2);
    assert_eq!(server.calls().done_uploads, 1);
}

#[tokio::test]
async fn test_gone_upload_is_reported_and_recorded() {
    let server = FakeServer::new();
    let (mut c, sg) = common::client_with_group(&server).await;
    let file = common::upload_and_sync(&mut c, sg, b"v0").await;
    server.mark_gone(&sg, &file, GoneReason::FileRemovedOrRenamed);
    c.delegate.clear();

    c.sync.enqueue(c.content(sg, file, b"v1")).await.unwrap();
    c.sync.sync(sg).await.unwrap();

    let events = c.delegate.events();
    assert!(events.contains(&Event::FileGone(file, GoneReason::FileRemovedOrRenamed)));
    assert!(!events.iter().any(|e| matches!(e, Event::ContentUploadsCompleted(_))));
    assert_eq!(events.last(), Some(&Event::SyncDone(sg)));
    assert_eq!(
        c.sync.directory_entry(&file).unwrap().gone_reason(),
        Some(GoneReason::FileRemovedOrRenamed)
    );
    assert_eq!(server.file(&sg, &file).unwrap().version, 0);
}

// ============================================================================
// Queue validation
// ============================================================================

#[tokio::test]
async fn test_pending_batch_belongs_to_one_sharing_group() {
    let server = FakeServer::new();
    let (mut c, family) = common::client_with_group(&server).await;
    let work = c.sync.create_sharing_group(Some("Work".into())).await.unwrap();

    c.sync.enqueue(c.content(family, FileUuid::new(), b"a")).await.unwrap();
    let result = c.sync.enqueue(c.content(work, FileUuid::new(), b"b")).await;
    assert!(matches!(
        result,
        Err(SyncError::AlreadyQueuedElsewhere { queued, requested }) if queued == family && requested == work
    ));

    // once the batch is synced the other group can queue
    c.sync.sync(family).await.unwrap();
    c.sync.enqueue(c.content(work, FileUuid::new(), b"b")).await.unwrap();
}

#[tokio::test]
async fn test_unknown_sharing_group_is_rejected() {
    let server = FakeServer::new();
    let mut c = common::client(&server).await;
    let stranger = groupsync_core::domain::SharingGroupId::new();

    let enqueue = c.sync.enqueue(c.content(stranger, FileUuid::new(), b"?")).await;
    assert!(matches!(enqueue, Err(SyncError::UnknownSharingGroup(_))));

    let sync = c.sync.sync(stranger).await;
    assert!(matches!(sync, Err(SyncError::UnknownSharingGroup(_))));
    assert!(c.delegate.events().is_empty());
}
