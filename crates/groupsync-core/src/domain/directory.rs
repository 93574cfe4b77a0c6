//! Directory: the local record of what is known to be synced
//!
//! One [`DirectoryEntry`] exists per file the client knows about. Entries are
//! created when a file is first queued for upload or first downloaded, updated
//! when an upload batch is committed or a download group is applied, and only
//! physically removed by an explicit reset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{
    AppMetaDataVersion, FileGroupUuid, FileUuid, FileVersion, GoneReason, SharingGroupId,
};

/// The last-known-synced state of a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Immutable file identity
    file_uuid: FileUuid,
    /// Sharing group the file belongs to
    sharing_group_id: SharingGroupId,
    /// File group, set on first sight and immutable afterwards
    file_group_uuid: Option<FileGroupUuid>,
    /// Mime type, fixed once the first content upload is queued
    mime_type: Option<String>,
    /// Last committed content version (`None` until version 0 reaches the server)
    file_version: Option<FileVersion>,
    /// Last committed application metadata
    app_meta_data: Option<String>,
    /// Version of `app_meta_data` (`None` until the first non-nil metadata)
    app_meta_data_version: Option<AppMetaDataVersion>,
    /// Whether the file has been deleted on this client
    deleted_locally: bool,
    /// Terminal reason the server gave for this file being unreachable
    gone_reason: Option<GoneReason>,
}

impl DirectoryEntry {
    /// Creates an entry for a file that has not been committed anywhere yet
    pub fn new(file_uuid: FileUuid, sharing_group_id: SharingGroupId) -> Self {
        Self {
            file_uuid,
            sharing_group_id,
            file_group_uuid: None,
            mime_type: None,
            file_version: None,
            app_meta_data: None,
            app_meta_data_version: None,
            deleted_locally: false,
            gone_reason: None,
        }
    }

    // --- Getters ---

    pub fn file_uuid(&self) -> &FileUuid {
        &self.file_uuid
    }

    pub fn sharing_group_id(&self) -> &SharingGroupId {
        &self.sharing_group_id
    }

    pub fn file_group_uuid(&self) -> Option<&FileGroupUuid> {
        self.file_group_uuid.as_ref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn file_version(&self) -> Option<FileVersion> {
        self.file_version
    }

    pub fn app_meta_data(&self) -> Option<&str> {
        self.app_meta_data.as_deref()
    }

    pub fn app_meta_data_version(&self) -> Option<AppMetaDataVersion> {
        self.app_meta_data_version
    }

    pub fn is_deleted_locally(&self) -> bool {
        self.deleted_locally
    }

    pub fn gone_reason(&self) -> Option<GoneReason> {
        self.gone_reason
    }

    /// Returns true once version 0 of the content has been committed
    pub fn is_on_server(&self) -> bool {
        self.file_version.is_some()
    }

    /// The content version the next upload must target
    pub fn next_file_version(&self) -> FileVersion {
        self.file_version.map_or(0, |v| v + 1)
    }

    /// The metadata version the next metadata upload must target
    pub fn next_app_meta_data_version(&self) -> AppMetaDataVersion {
        self.app_meta_data_version.map_or(0, |v| v + 1)
    }

    // --- Mutators ---

    /// Records the file group on first sight
    ///
    /// # Errors
    /// Returns `DomainError::FileGroupChanged` if a different group was
    /// already recorded.
    pub fn record_file_group(&mut self, group: Option<FileGroupUuid>) -> Result<(), DomainError> {
        match (self.file_group_uuid, group) {
            (_, None) => Ok(()),
            (None, Some(new)) => {
                self.file_group_uuid = Some(new);
                Ok(())
            }
            (Some(existing), Some(new)) if existing == new => Ok(()),
            (Some(existing), Some(new)) => Err(DomainError::FileGroupChanged {
                file: self.file_uuid.to_string(),
                expected: existing.to_string(),
                actual: new.to_string(),
            }),
        }
    }

    /// Records the mime type if none is known yet
    pub fn record_mime_type(&mut self, mime_type: Option<&str>) {
        if self.mime_type.is_none() {
            self.mime_type = mime_type.map(str::to_string);
        }
    }

    /// Records a committed content version
    pub fn commit_file_version(&mut self, version: FileVersion) {
        self.file_version = Some(version);
    }

    /// Records committed application metadata
    pub fn commit_app_meta_data(&mut self, contents: String, version: AppMetaDataVersion) {
        self.app_meta_data = Some(contents);
        self.app_meta_data_version = Some(version);
    }

    /// Records a metadata version without its contents (rejected remote metadata)
    pub fn commit_app_meta_data_version(&mut self, version: AppMetaDataVersion) {
        self.app_meta_data_version = Some(version);
    }

    pub fn mark_deleted_locally(&mut self) {
        self.deleted_locally = true;
    }

    pub fn clear_deleted_locally(&mut self) {
        self.deleted_locally = false;
    }

    pub fn set_gone_reason(&mut self, reason: Option<GoneReason>) {
        self.gone_reason = reason;
    }
}

/// Collection of all directory entries, keyed by file identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<FileUuid, DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry for a file
    pub fn get(&self, file_uuid: &FileUuid) -> Option<&DirectoryEntry> {
        self.entries.get(file_uuid)
    }

    /// Looks up the entry for a file, mutably
    pub fn get_mut(&mut self, file_uuid: &FileUuid) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(file_uuid)
    }

    /// Returns the entry for a file, creating it if needed
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if the file is already known
    /// under a different sharing group.
    pub fn entry_or_insert(
        &mut self,
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
    ) -> Result<&mut DirectoryEntry, DomainError> {
        let entry = self
            .entries
            .entry(file_uuid)
            .or_insert_with(|| DirectoryEntry::new(file_uuid, sharing_group_id));
        if entry.sharing_group_id != sharing_group_id {
            return Err(DomainError::ValidationFailed(format!(
                "file {} belongs to sharing group {}, not {}",
                file_uuid, entry.sharing_group_id, sharing_group_id
            )));
        }
        Ok(entry)
    }

    /// Inserts or replaces an entry
    pub fn insert(&mut self, entry: DirectoryEntry) {
        self.entries.insert(entry.file_uuid, entry);
    }

    /// Iterates over all entries
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Iterates over the entries of one sharing group
    pub fn in_sharing_group<'a>(
        &'a self,
        sharing_group_id: &'a SharingGroupId,
    ) -> impl Iterator<Item = &'a DirectoryEntry> + 'a {
        self.entries
            .values()
            .filter(move |e| &e.sharing_group_id == sharing_group_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry (explicit reset only)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
