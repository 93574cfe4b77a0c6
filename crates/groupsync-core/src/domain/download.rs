//! Download trackers and content groups
//!
//! Remote changes discovered by a scan become [`DownloadFileTracker`]s. Each
//! tracker belongs to exactly one [`DownloadContentGroup`], the unit that is
//! delivered to the collaborator atomically. Trackers refer to their group by
//! identifier only; [`DownloadGroups`] is the arena that owns both.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{
    AppMetaDataVersion, DownloadGroupId, FileGroupUuid, FileUuid, FileVersion, GoneReason,
    MasterVersion, SharingGroupId, TrackerId,
};

/// What kind of remote change a tracker represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    /// New file or new content version
    Content,
    /// Same content version, newer application metadata
    AppMetaDataOnly,
    /// The file was deleted on the server
    Deletion,
}

impl fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadKind::Content => "content",
            DownloadKind::AppMetaDataOnly => "app_meta_data_only",
            DownloadKind::Deletion => "deletion",
        };
        write!(f, "{}", s)
    }
}

/// Transfer status of a download tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    NotStarted,
    Downloading,
    Downloaded,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::NotStarted => "not_started",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
        };
        write!(f, "{}", s)
    }
}

/// A single discovered remote change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileTracker {
    id: TrackerId,
    group_id: DownloadGroupId,
    pub file_uuid: FileUuid,
    pub sharing_group_id: SharingGroupId,
    pub file_group_uuid: Option<FileGroupUuid>,
    pub kind: DownloadKind,
    status: DownloadStatus,
    /// Remote content version
    pub file_version: FileVersion,
    /// Remote metadata version, if the file carries metadata
    pub app_meta_data_version: Option<AppMetaDataVersion>,
    pub mime_type: Option<String>,
    /// Where the fetched content was written
    pub local_path: Option<PathBuf>,
    /// Fetched application metadata
    pub app_meta_data: Option<String>,
    pub gone_reason: Option<GoneReason>,
}

impl DownloadFileTracker {
    /// Creates a tracker for a remote change
    ///
    /// Deletion trackers need no transfer and start out as `Downloaded`.
    pub fn new(
        file_uuid: FileUuid,
        sharing_group_id: SharingGroupId,
        kind: DownloadKind,
        file_version: FileVersion,
    ) -> Self {
        let status = match kind {
            DownloadKind::Deletion => DownloadStatus::Downloaded,
            _ => DownloadStatus::NotStarted,
        };
        Self {
            id: TrackerId::new(),
            group_id: DownloadGroupId::nil(),
            file_uuid,
            sharing_group_id,
            file_group_uuid: None,
            kind,
            status,
            file_version,
            app_meta_data_version: None,
            mime_type: None,
            local_path: None,
            app_meta_data: None,
            gone_reason: None,
        }
    }

    pub fn id(&self) -> &TrackerId {
        &self.id
    }

    pub fn group_id(&self) -> &DownloadGroupId {
        &self.group_id
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn is_downloaded(&self) -> bool {
        self.status == DownloadStatus::Downloaded
    }

    /// NotStarted -> Downloading
    pub fn start(&mut self) -> Result<(), DomainError> {
        match self.status {
            DownloadStatus::NotStarted => {
                self.status = DownloadStatus::Downloading;
                Ok(())
            }
            other => Err(invalid(other, DownloadStatus::Downloading)),
        }
    }

    /// NotStarted | Downloading -> Downloaded
    pub fn complete(&mut self) -> Result<(), DomainError> {
        match self.status {
            DownloadStatus::NotStarted | DownloadStatus::Downloading => {
                self.status = DownloadStatus::Downloaded;
                Ok(())
            }
            other => Err(invalid(other, DownloadStatus::Downloaded)),
        }
    }

    /// Downloading -> NotStarted
    pub fn reset(&mut self) -> Result<(), DomainError> {
        match self.status {
            DownloadStatus::Downloading => {
                self.status = DownloadStatus::NotStarted;
                Ok(())
            }
            other => Err(invalid(other, DownloadStatus::NotStarted)),
        }
    }
}

fn invalid(from: DownloadStatus, to: DownloadStatus) -> DomainError {
    DomainError::InvalidState {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// The atomic delivery unit for one file group (or one ungrouped file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadContentGroup {
    id: DownloadGroupId,
    sharing_group_id: SharingGroupId,
    file_group_uuid: Option<FileGroupUuid>,
    /// Master version the group's changes were discovered at
    master_version: MasterVersion,
}

impl DownloadContentGroup {
    pub fn new(
        sharing_group_id: SharingGroupId,
        file_group_uuid: Option<FileGroupUuid>,
        master_version: MasterVersion,
    ) -> Self {
        Self {
            id: DownloadGroupId::new(),
            sharing_group_id,
            file_group_uuid,
            master_version,
        }
    }

    pub fn id(&self) -> &DownloadGroupId {
        &self.id
    }

    pub fn sharing_group_id(&self) -> &SharingGroupId {
        &self.sharing_group_id
    }

    pub fn file_group_uuid(&self) -> Option<&FileGroupUuid> {
        self.file_group_uuid.as_ref()
    }

    pub fn master_version(&self) -> MasterVersion {
        self.master_version
    }
}

/// Arena of download content groups and their trackers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadGroups {
    groups: Vec<DownloadContentGroup>,
    trackers: Vec<DownloadFileTracker>,
}

impl DownloadGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembles the arena from persisted rows
    pub fn from_parts(groups: Vec<DownloadContentGroup>, trackers: Vec<DownloadFileTracker>) -> Self {
        Self { groups, trackers }
    }

    /// Adds a tracker, placing it in the group for its file group
    ///
    /// Trackers without a file group get a singleton group of their own.
    ///
    /// # Errors
    /// Returns `DomainError::SharingGroupMismatchInGroup` if the tracker's
    /// sharing group differs from that of the group it would join.
    pub fn add(
        &mut self,
        mut tracker: DownloadFileTracker,
        master_version: MasterVersion,
    ) -> Result<DownloadGroupId, DomainError> {
        let existing = tracker.file_group_uuid.and_then(|fg| {
            self.groups
                .iter()
                .find(|g| g.file_group_uuid == Some(fg))
                .cloned()
        });

        let group_id = match existing {
            Some(group) => {
                if group.sharing_group_id != tracker.sharing_group_id {
                    return Err(DomainError::SharingGroupMismatchInGroup {
                        group: group.id.to_string(),
                        expected: group.sharing_group_id.to_string(),
                        actual: tracker.sharing_group_id.to_string(),
                    });
                }
                group.id
            }
            None => {
                let group = DownloadContentGroup::new(
                    tracker.sharing_group_id,
                    tracker.file_group_uuid,
                    master_version,
                );
                let id = group.id;
                self.groups.push(group);
                id
            }
        };

        tracker.group_id = group_id;
        self.trackers.push(tracker);
        Ok(group_id)
    }

    pub fn groups(&self) -> &[DownloadContentGroup] {
        &self.groups
    }

    pub fn trackers(&self) -> &[DownloadFileTracker] {
        &self.trackers
    }

    pub fn group(&self, id: &DownloadGroupId) -> Option<&DownloadContentGroup> {
        self.groups.iter().find(|g| &g.id == id)
    }

    /// Members of a group, in discovery order
    pub fn members<'a>(
        &'a self,
        group_id: &'a DownloadGroupId,
    ) -> impl Iterator<Item = &'a DownloadFileTracker> + 'a {
        self.trackers.iter().filter(move |t| &t.group_id == group_id)
    }

    pub fn tracker(&self, id: &TrackerId) -> Option<&DownloadFileTracker> {
        self.trackers.iter().find(|t| &t.id == id)
    }

    pub fn tracker_mut(&mut self, id: &TrackerId) -> Option<&mut DownloadFileTracker> {
        self.trackers.iter_mut().find(|t| &t.id == id)
    }

    /// Trackers for one file across all groups
    pub fn for_file<'a>(
        &'a self,
        file_uuid: &'a FileUuid,
    ) -> impl Iterator<Item = &'a DownloadFileTracker> + 'a {
        self.trackers.iter().filter(move |t| &t.file_uuid == file_uuid)
    }

    /// Returns true if any tracker has a transfer outstanding
    pub fn any_downloading(&self) -> bool {
        self.trackers
            .iter()
            .any(|t| t.status == DownloadStatus::Downloading)
    }

    /// Returns true once every member of the group is downloaded
    pub fn is_complete(&self, group_id: &DownloadGroupId) -> bool {
        self.members(group_id).all(DownloadFileTracker::is_downloaded)
    }

    /// Groups of one sharing group
    pub fn in_sharing_group<'a>(
        &'a self,
        sharing_group_id: &'a SharingGroupId,
    ) -> impl Iterator<Item = &'a DownloadContentGroup> + 'a {
        self.groups
            .iter()
            .filter(move |g| &g.sharing_group_id == sharing_group_id)
    }

    /// Removes a group and all of its trackers, returning the trackers
    pub fn remove_group(&mut self, group_id: &DownloadGroupId) -> Vec<DownloadFileTracker> {
        self.groups.retain(|g| &g.id != group_id);
        let (removed, kept) = std::mem::take(&mut self.trackers)
            .into_iter()
            .partition(|t| &t.group_id == group_id);
        self.trackers = kept;
        removed
    }

    /// Removes a single tracker, dropping its group if it was the last member
    pub fn remove_tracker(&mut self, id: &TrackerId) -> Option<DownloadFileTracker> {
        let pos = self.trackers.iter().position(|t| &t.id == id)?;
        let tracker = self.trackers.remove(pos);
        if self.members(&tracker.group_id).next().is_none() {
            let group_id = tracker.group_id;
            self.groups.retain(|g| g.id != group_id);
        }
        Some(tracker)
    }

    /// Drops every group of one sharing group
    pub fn clear_sharing_group(&mut self, sharing_group_id: &SharingGroupId) {
        self.groups.retain(|g| &g.sharing_group_id != sharing_group_id);
        self.trackers.retain(|t| &t.sharing_group_id != sharing_group_id);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.trackers.clear();
    }
}
