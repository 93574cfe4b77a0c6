//! Conflict domain entities
//!
//! This module defines the types used when an incoming remote change collides
//! with local work that has not reached the server yet. A collision produces
//! a [`PendingDecision`]; the decision is answered with a
//! [`ConflictResolution`] of the matching kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::download::DownloadKind;
use super::newtypes::{
    AppMetaDataVersion, DecisionId, DownloadGroupId, FileUuid, FileVersion, SharingGroupId,
};

/// What a pending content upload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentUploadKind {
    /// File content only
    File,
    /// Application metadata only
    AppMetaData,
    /// File content together with application metadata
    Both,
}

/// The local work that collides with a remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictingClientOperation {
    ContentUpload(ContentUploadKind),
    UploadDeletion,
    /// A content upload and a deletion are both outstanding
    Both(ContentUploadKind),
}

impl ConflictingClientOperation {
    /// Classifies outstanding local work; `None` if there is none
    pub fn from_flags(content: bool, app_meta_data: bool, deletion: bool) -> Option<Self> {
        let upload = match (content, app_meta_data) {
            (true, true) => Some(ContentUploadKind::Both),
            (true, false) => Some(ContentUploadKind::File),
            (false, true) => Some(ContentUploadKind::AppMetaData),
            (false, false) => None,
        };
        match (upload, deletion) {
            (Some(kind), true) => Some(Self::Both(kind)),
            (Some(kind), false) => Some(Self::ContentUpload(kind)),
            (None, true) => Some(Self::UploadDeletion),
            (None, false) => None,
        }
    }

    pub fn content_upload(&self) -> Option<ContentUploadKind> {
        match self {
            Self::ContentUpload(kind) | Self::Both(kind) => Some(*kind),
            Self::UploadDeletion => None,
        }
    }

    pub fn has_deletion(&self) -> bool {
        matches!(self, Self::UploadDeletion | Self::Both(_))
    }

    /// Returns true if the only content-side work is application metadata
    pub fn is_app_meta_data_only(&self) -> bool {
        self.content_upload() == Some(ContentUploadKind::AppMetaData)
    }
}

/// One file's collision inside a download deletion conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub file_uuid: FileUuid,
    pub operation: ConflictingClientOperation,
}

/// Remote deletions in one download group that collide with local uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDeletionConflict {
    pub conflicts: Vec<FileConflict>,
}

/// A remote content or metadata change colliding with local work on the same file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDownloadConflict {
    pub file_uuid: FileUuid,
    pub download_kind: DownloadKind,
    pub remote_file_version: FileVersion,
    pub remote_app_meta_data_version: Option<AppMetaDataVersion>,
    pub operation: ConflictingClientOperation,
}

/// The two decision shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionKind {
    DownloadDeletion(DownloadDeletionConflict),
    ContentDownload(ContentDownloadConflict),
}

/// A conflict awaiting an answer from the collaborator
///
/// The download group it belongs to is held back until every decision
/// referencing the group has been answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecision {
    id: DecisionId,
    group_id: DownloadGroupId,
    sharing_group_id: SharingGroupId,
    kind: DecisionKind,
    detected_at: DateTime<Utc>,
}

impl PendingDecision {
    pub fn new(group_id: DownloadGroupId, sharing_group_id: SharingGroupId, kind: DecisionKind) -> Self {
        Self {
            id: DecisionId::new(),
            group_id,
            sharing_group_id,
            kind,
            detected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &DecisionId {
        &self.id
    }

    pub fn group_id(&self) -> &DownloadGroupId {
        &self.group_id
    }

    pub fn sharing_group_id(&self) -> &SharingGroupId {
        &self.sharing_group_id
    }

    pub fn kind(&self) -> &DecisionKind {
        &self.kind
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    /// Files this decision covers
    pub fn files(&self) -> Vec<FileUuid> {
        match &self.kind {
            DecisionKind::DownloadDeletion(c) => c.conflicts.iter().map(|f| f.file_uuid).collect(),
            DecisionKind::ContentDownload(c) => vec![c.file_uuid],
        }
    }
}

// ============================================================================
// Resolutions
// ============================================================================

/// How a rejected download deletion treats the local content upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionRejection {
    /// Re-send the local content as an undelete
    KeepContentUpload,
    /// Drop the local upload and let the deletion apply
    RemoveContentUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadDeletionResolution {
    AcceptDownloadDeletion,
    RejectDownloadDeletion(DeletionRejection),
}

/// Which local work survives a rejected content download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadResolution {
    KeepContentUploads,
    KeepUploadDeletions,
    KeepAll,
    RemoveAll,
}

impl UploadResolution {
    pub fn keeps_content_uploads(&self) -> bool {
        matches!(self, Self::KeepContentUploads | Self::KeepAll)
    }

    pub fn keeps_upload_deletions(&self) -> bool {
        matches!(self, Self::KeepUploadDeletions | Self::KeepAll)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentDownloadResolution {
    AcceptContentDownload,
    RejectContentDownload(UploadResolution),
}

/// An answer to a [`PendingDecision`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    DownloadDeletion(DownloadDeletionResolution),
    ContentDownload(ContentDownloadResolution),
}

impl From<DownloadDeletionResolution> for ConflictResolution {
    fn from(r: DownloadDeletionResolution) -> Self {
        Self::DownloadDeletion(r)
    }
}

impl From<ContentDownloadResolution> for ConflictResolution {
    fn from(r: ContentDownloadResolution) -> Self {
        Self::ContentDownload(r)
    }
}

/// Who answered a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// The collaborator answered when notified
    Delegate,
    /// The configured default strategy answered
    Policy,
    /// An explicit resolve call
    User,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionSource::Delegate => "delegate",
            ResolutionSource::Policy => "policy",
            ResolutionSource::User => "user",
        };
        write!(f, "{}", s)
    }
}
