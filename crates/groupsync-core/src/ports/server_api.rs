//! Server API port (driven/secondary port)
//!
//! This module defines the calls the engine makes against the sync server.
//! The transport (HTTP, TLS, socket-level retries, credentials) belongs to the
//! adapter; the engine only relies on the contracts expressed here.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` for transport failures, which the engine surfaces
//!   as recoverable sync errors.
//! - Protocol-level outcomes that the engine must react to (a stale master
//!   version, a gone file) are part of the successful return value as a
//!   [`ServerResponse`], so they can never be confused with a transport error.
//! - Every batch-completing call carries the master version the client
//!   believes is current.

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{
    AppMetaDataVersion, FileGroupUuid, FileUuid, FileVersion, GoneReason, MasterVersion,
    SharingGroupId,
};

// ============================================================================
// Responses
// ============================================================================

/// Protocol-level outcome of a server call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerResponse<T> {
    Success(T),
    /// The expected master version was stale; `current` is the server's value
    MasterVersionConflict { current: MasterVersion },
    /// Terminal failure for this file
    Gone(GoneReason),
}

impl<T> ServerResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ServerResponse::Success(_))
    }
}

/// One file in the server's index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub file_group_uuid: Option<FileGroupUuid>,
    pub mime_type: Option<String>,
    pub file_version: FileVersion,
    pub app_meta_data_version: Option<AppMetaDataVersion>,
    pub deleted: bool,
    pub gone_reason: Option<GoneReason>,
}

/// One sharing group the user belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSharingGroup {
    pub sharing_group_id: SharingGroupId,
    pub name: Option<String>,
    pub master_version: MasterVersion,
    pub deleted: bool,
}

/// Authoritative snapshot returned by the index call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    /// Master version of the requested sharing group, if one was requested
    pub master_version: Option<MasterVersion>,
    pub files: Vec<RemoteFileInfo>,
    pub sharing_groups: Vec<RemoteSharingGroup>,
}

// ============================================================================
// Requests
// ============================================================================

/// Content upload, optionally carrying application metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFileRequest {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub file_group_uuid: Option<FileGroupUuid>,
    pub mime_type: Option<String>,
    pub file_version: FileVersion,
    pub app_meta_data: Option<(String, AppMetaDataVersion)>,
    pub undelete: bool,
    pub master_version: MasterVersion,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAppMetaDataRequest {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub contents: String,
    pub version: AppMetaDataVersion,
    pub master_version: MasterVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDeletionRequest {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub file_version: Option<FileVersion>,
    pub master_version: MasterVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub version: u64,
    pub master_version: MasterVersion,
}

/// Fetched file content with the metadata stored alongside that version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub contents: Vec<u8>,
    pub app_meta_data: Option<String>,
}

// ============================================================================
// Sharing invitations
// ============================================================================

/// Permission granted by an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationInfo {
    pub permission: Permission,
    pub allow_social_acceptance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemedInvitation {
    pub sharing_group_id: SharingGroupId,
    pub name: Option<String>,
}

// ============================================================================
// IServerApi trait
// ============================================================================

/// Port trait for the sync server
#[async_trait::async_trait]
pub trait IServerApi: Send + Sync {
    /// Fetches the authoritative index
    ///
    /// With `None`, only the sharing groups are listed and `files` is empty.
    async fn file_index(&self, sharing_group_id: Option<&SharingGroupId>) -> anyhow::Result<FileIndex>;

    async fn upload_file(&self, request: &UploadFileRequest) -> anyhow::Result<ServerResponse<()>>;

    async fn upload_app_meta_data(
        &self,
        request: &UploadAppMetaDataRequest,
    ) -> anyhow::Result<ServerResponse<()>>;

    async fn upload_deletion(
        &self,
        request: &UploadDeletionRequest,
    ) -> anyhow::Result<ServerResponse<()>>;

    /// Commits every upload sent for the sharing group since the last commit
    ///
    /// On success the server's master version becomes `expected + 1` and the
    /// number of committed uploads is returned.
    async fn done_uploads(
        &self,
        sharing_group_id: &SharingGroupId,
        expected: MasterVersion,
        deletion_count: usize,
    ) -> anyhow::Result<ServerResponse<usize>>;

    async fn download_file(&self, request: &DownloadRequest) -> anyhow::Result<ServerResponse<FileDownload>>;

    async fn download_app_meta_data(
        &self,
        request: &DownloadRequest,
    ) -> anyhow::Result<ServerResponse<String>>;

    async fn create_sharing_group(
        &self,
        sharing_group_id: &SharingGroupId,
        name: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn update_sharing_group(
        &self,
        sharing_group_id: &SharingGroupId,
        name: Option<&str>,
        expected: MasterVersion,
    ) -> anyhow::Result<ServerResponse<()>>;

    async fn remove_sharing_group(
        &self,
        sharing_group_id: &SharingGroupId,
        expected: MasterVersion,
    ) -> anyhow::Result<ServerResponse<()>>;

    async fn remove_user_from_sharing_group(
        &self,
        sharing_group_id: &SharingGroupId,
        expected: MasterVersion,
    ) -> anyhow::Result<ServerResponse<()>>;

    /// Returns the invitation code
    async fn create_sharing_invitation(
        &self,
        sharing_group_id: &SharingGroupId,
        permission: Permission,
        allow_social_acceptance: bool,
        number_of_acceptors: u32,
    ) -> anyhow::Result<String>;

    async fn redeem_sharing_invitation(&self, code: &str) -> anyhow::Result<RedeemedInvitation>;

    async fn get_sharing_invitation_info(&self, code: &str) -> anyhow::Result<InvitationInfo>;
}
