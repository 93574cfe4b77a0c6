//! SQLite implementation of IStateStore
//!
//! The whole [`SyncState`] is written inside one SQLite transaction, so a
//! crash either leaves the previous commit or the new one, never a mix.
//!
//! ## Type Mapping
//!
//! | Domain Type                    | Table               | Strategy                         |
//! |--------------------------------|---------------------|----------------------------------|
//! | SharingGroup                   | sharing_groups      | key columns + serde_json `data`  |
//! | DirectoryEntry                 | directory_entries   | key columns + serde_json `data`  |
//! | UploadQueue                    | upload_queues       | id, FIFO position, DoneUploads mv|
//! | UploadFileTracker              | upload_trackers     | key columns + serde_json `data`  |
//! | DownloadContentGroup           | download_groups     | key columns + serde_json `data`  |
//! | DownloadFileTracker            | download_trackers   | key columns + serde_json `data`  |
//! | NetworkResult                  | network_results     | operation key + serde_json `data`|
//! | PendingDecision                | pending_decisions   | key columns + serde_json `data`  |
//! | queued sync request            | sync_requests       | position, sharing group          |

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use groupsync_core::domain::{
    DirectoryEntry, DownloadContentGroup, DownloadFileTracker, DownloadGroups, MasterVersion, NetworkResult,
    PendingDecision, QueueId, SharingGroup, SharingGroupId, SyncState, UploadFileTracker,
    UploadQueue,
};
use groupsync_core::ports::IStateStore;

use crate::CacheError;

/// Position marker of the pending batch in `upload_queues`
const PENDING_POSITION: i64 = -1;

/// SQLite-based implementation of the state store port
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn to_json<T: Serialize>(value: &T) -> Result<String, CacheError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserializes the `data` column of a row
fn data_from_row<T: DeserializeOwned>(row: &SqliteRow) -> Result<T, CacheError> {
    let data: String = row.get("data");
    serde_json::from_str(&data).map_err(|e| {
        CacheError::SerializationError(format!("Invalid row data '{}': {}", data, e))
    })
}

fn parse_id<T>(s: &str) -> Result<T, CacheError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(s).map_err(|e| CacheError::SerializationError(format!("Invalid id '{}': {}", s, e)))
}

// ============================================================================
// Writing
// ============================================================================

async fn clear_all(tx: &mut Transaction<'_, Sqlite>) -> Result<(), CacheError> {
    for table in [
        "pending_decisions",
        "download_trackers",
        "download_groups",
        "upload_trackers",
        "upload_queues",
        "directory_entries",
        "sharing_groups",
        "network_results",
        "sync_requests",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn write_queue(
    tx: &mut Transaction<'_, Sqlite>,
    queue: &UploadQueue,
    position: i64,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO upload_queues (id, sharing_group_id, position, done_uploads_master_version) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(queue.id().to_string())
    .bind(queue.sharing_group_id().to_string())
    .bind(position)
    .bind(queue.done_uploads_sent().map(|mv| mv.value() as i64))
    .execute(&mut **tx)
    .await?;

    for (i, tracker) in queue.trackers.iter().enumerate() {
        sqlx::query(
            "INSERT INTO upload_trackers \
             (id, queue_id, position, file_uuid, operation, status, data) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tracker.id().to_string())
        .bind(queue.id().to_string())
        .bind(i as i64)
        .bind(tracker.file_uuid.to_string())
        .bind(tracker.operation.to_string())
        .bind(tracker.status().to_string())
        .bind(to_json(tracker)?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_state(tx: &mut Transaction<'_, Sqlite>, state: &SyncState) -> Result<(), CacheError> {
    clear_all(tx).await?;

    for group in state.sharing_groups.values() {
        sqlx::query(
            "INSERT INTO sharing_groups (id, master_version, removed, data) VALUES (?, ?, ?, ?)",
        )
        .bind(group.id().to_string())
        .bind(group.master_version().value() as i64)
        .bind(group.is_removed())
        .bind(to_json(group)?)
        .execute(&mut **tx)
        .await?;
    }

    for entry in state.directory.iter() {
        sqlx::query(
            "INSERT INTO directory_entries \
             (file_uuid, sharing_group_id, file_version, deleted_locally, data) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.file_uuid().to_string())
        .bind(entry.sharing_group_id().to_string())
        .bind(entry.file_version().map(|v| v as i64))
        .bind(entry.is_deleted_locally())
        .bind(to_json(entry)?)
        .execute(&mut **tx)
        .await?;
    }

    if let Some(pending) = &state.upload_queues.pending {
        write_queue(tx, pending, PENDING_POSITION).await?;
    }
    for (i, queue) in state.upload_queues.synced.iter().enumerate() {
        write_queue(tx, queue, i as i64).await?;
    }

    for (i, group) in state.download_groups.groups().iter().enumerate() {
        sqlx::query(
            "INSERT INTO download_groups (id, sharing_group_id, position, data) VALUES (?, ?, ?, ?)",
        )
        .bind(group.id().to_string())
        .bind(group.sharing_group_id().to_string())
        .bind(i as i64)
        .bind(to_json(group)?)
        .execute(&mut **tx)
        .await?;
    }
    for (i, tracker) in state.download_groups.trackers().iter().enumerate() {
        sqlx::query(
            "INSERT INTO download_trackers \
             (id, group_id, position, file_uuid, kind, status, data) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tracker.id().to_string())
        .bind(tracker.group_id().to_string())
        .bind(i as i64)
        .bind(tracker.file_uuid.to_string())
        .bind(tracker.kind.to_string())
        .bind(tracker.status().to_string())
        .bind(to_json(tracker)?)
        .execute(&mut **tx)
        .await?;
    }

    for result in state.network_cache.iter() {
        sqlx::query("INSERT INTO network_results (operation_key, recorded_at, data) VALUES (?, ?, ?)")
            .bind(result.key.to_string())
            .bind(result.recorded_at.to_rfc3339())
            .bind(to_json(result)?)
            .execute(&mut **tx)
            .await?;
    }

    for (i, decision) in state.decisions.iter().enumerate() {
        sqlx::query("INSERT INTO pending_decisions (id, group_id, position, data) VALUES (?, ?, ?, ?)")
            .bind(decision.id().to_string())
            .bind(decision.group_id().to_string())
            .bind(i as i64)
            .bind(to_json(decision)?)
            .execute(&mut **tx)
            .await?;
    }

    for (i, sharing_group_id) in state.sync_requests.iter().enumerate() {
        sqlx::query("INSERT INTO sync_requests (position, sharing_group_id) VALUES (?, ?)")
            .bind(i as i64)
            .bind(sharing_group_id.to_string())
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

// ============================================================================
// Reading
// ============================================================================

impl SqliteStateStore {
    async fn read_queues(&self, state: &mut SyncState) -> Result<(), CacheError> {
        let queue_rows =
            sqlx::query(
                "SELECT id, sharing_group_id, position, done_uploads_master_version \
                 FROM upload_queues ORDER BY position ASC",
            )
            .fetch_all(&self.pool)
            .await?;

        for row in &queue_rows {
            let id_str: String = row.get("id");
            let sg_str: String = row.get("sharing_group_id");
            let position: i64 = row.get("position");
            let done_uploads: Option<i64> = row.get("done_uploads_master_version");

            let mut queue =
                UploadQueue::with_id(parse_id::<QueueId>(&id_str)?, parse_id::<SharingGroupId>(&sg_str)?);

            let tracker_rows =
                sqlx::query("SELECT data FROM upload_trackers WHERE queue_id = ? ORDER BY position ASC")
                    .bind(&id_str)
                    .fetch_all(&self.pool)
                    .await?;
            for tracker_row in &tracker_rows {
                queue.trackers.push(data_from_row::<UploadFileTracker>(tracker_row)?);
            }
            queue.restore_done_uploads_sent(done_uploads.map(|mv| MasterVersion::new(mv as u64)));

            if position == PENDING_POSITION {
                state.upload_queues.pending = Some(queue);
            } else {
                state.upload_queues.synced.push_back(queue);
            }
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<SyncState, CacheError> {
        let mut state = SyncState::new();

        let rows = sqlx::query("SELECT data FROM sharing_groups")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let group: SharingGroup = data_from_row(row)?;
            state.sharing_groups.insert(*group.id(), group);
        }

        let rows = sqlx::query("SELECT data FROM directory_entries")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            state.directory.insert(data_from_row::<DirectoryEntry>(row)?);
        }

        self.read_queues(&mut state).await?;

        let group_rows = sqlx::query("SELECT data FROM download_groups ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        let groups = group_rows
            .iter()
            .map(data_from_row::<DownloadContentGroup>)
            .collect::<Result<Vec<_>, _>>()?;
        let tracker_rows = sqlx::query("SELECT data FROM download_trackers ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        let trackers = tracker_rows
            .iter()
            .map(data_from_row::<DownloadFileTracker>)
            .collect::<Result<Vec<_>, _>>()?;
        state.download_groups = DownloadGroups::from_parts(groups, trackers);

        let rows = sqlx::query("SELECT data FROM network_results")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            state.network_cache.insert(data_from_row::<NetworkResult>(row)?);
        }

        let rows = sqlx::query("SELECT data FROM pending_decisions ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            state.decisions.push(data_from_row::<PendingDecision>(row)?);
        }

        let rows = sqlx::query("SELECT sharing_group_id FROM sync_requests ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let sg: String = row.get("sharing_group_id");
            state.sync_requests.push_back(parse_id(&sg)?);
        }

        Ok(state)
    }
}

// ============================================================================
// IStateStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateStore for SqliteStateStore {
    async fn load(&self) -> anyhow::Result<SyncState> {
        let state = self.read_state().await?;
        tracing::debug!(
            sharing_groups = state.sharing_groups.len(),
            directory_entries = state.directory.len(),
            pending_uploads = state.upload_queues.outstanding_count(),
            "Loaded sync state"
        );
        Ok(state)
    }

    async fn save(&self, state: &SyncState) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        write_state(&mut tx, state).await?;
        tx.commit().await.map_err(CacheError::from)?;
        tracing::trace!("Saved sync state");
        Ok(())
    }
}
