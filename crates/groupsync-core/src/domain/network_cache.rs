//! Network result cache
//!
//! Before a transfer is issued, its outcome slot is looked up by an
//! [`OperationKey`]. A hit means the call already completed in an earlier
//! process and is replayed instead of being re-sent. Entries are written
//! as soon as a call returns and removed once the owning tracker is
//! committed, or dropped by age.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{FileUuid, GoneReason, SharingGroupId};

/// Direction of a network operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// Which server call an operation key refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Content,
    AppMetaData,
    Deletion,
}

/// Identity of a single network operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub file_uuid: FileUuid,
    pub version: u64,
    pub direction: Direction,
    pub kind: OperationKind,
    pub sharing_group_id: SharingGroupId,
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Upload => "up",
            Direction::Download => "down",
        };
        let kind = match self.kind {
            OperationKind::Content => "content",
            OperationKind::AppMetaData => "meta",
            OperationKind::Deletion => "delete",
        };
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.sharing_group_id, self.file_uuid, direction, kind, self.version
        )
    }
}

/// The recorded outcome of a completed network call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CachedOutcome {
    /// An upload the server accepted
    Uploaded,
    /// A download, with where its content was written
    Downloaded {
        local_path: Option<PathBuf>,
        app_meta_data: Option<String>,
    },
    /// A terminal gone response
    Gone { reason: GoneReason },
}

/// A cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResult {
    pub key: OperationKey,
    pub outcome: CachedOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Idempotent replay store for network outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkResultCache {
    entries: BTreeMap<String, NetworkResult>,
}

impl NetworkResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &OperationKey) -> Option<&NetworkResult> {
        self.entries.get(&key.to_string())
    }

    /// Records an outcome, replacing any earlier one for the same key
    pub fn put(&mut self, key: OperationKey, outcome: CachedOutcome, now: DateTime<Utc>) {
        self.insert(NetworkResult {
            key,
            outcome,
            recorded_at: now,
        });
    }

    /// Inserts a fully formed entry
    pub fn insert(&mut self, result: NetworkResult) {
        self.entries.insert(result.key.to_string(), result);
    }

    pub fn remove(&mut self, key: &OperationKey) -> Option<NetworkResult> {
        self.entries.remove(&key.to_string())
    }

    /// Drops entries older than `ttl`, returning how many were removed
    pub fn gc(&mut self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, r| now - r.recorded_at <= ttl);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkResult> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
