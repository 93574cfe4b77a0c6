//! SharingGroup domain entity
//!
//! A sharing group is the consistency scope for a set of files: all files in
//! the group share one server-maintained master version. Groups are created
//! on first discovery (or an explicit creation call), updated only by the
//! sync machinery, and never deleted locally, only marked as removed.

use serde::{Deserialize, Serialize};

use super::newtypes::{MasterVersion, SharingGroupId};

/// A sharing group as known locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroup {
    /// Server-assigned identifier
    id: SharingGroupId,
    /// Optional human-readable name
    name: Option<String>,
    /// Last master version this client has synchronized with
    master_version: MasterVersion,
    /// Whether the current user is no longer a member
    removed_from_group: bool,
    /// Set when a locally-unknown remote change has been detected
    sync_needed: bool,
}

impl SharingGroup {
    /// Creates a newly discovered sharing group at master version 0
    pub fn new(id: SharingGroupId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            master_version: MasterVersion::default(),
            removed_from_group: false,
            sync_needed: false,
        }
    }

    // --- Getters ---

    /// Returns the sharing group identifier
    pub fn id(&self) -> &SharingGroupId {
        &self.id
    }

    /// Returns the group name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the locally known master version
    pub fn master_version(&self) -> MasterVersion {
        self.master_version
    }

    /// Returns true if the user has been removed from this group
    pub fn is_removed(&self) -> bool {
        self.removed_from_group
    }

    /// Returns true if a remote change is known but not yet synced
    pub fn sync_needed(&self) -> bool {
        self.sync_needed
    }

    // --- Mutators ---

    /// Renames the group
    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// Records the authoritative master version
    pub fn set_master_version(&mut self, master_version: MasterVersion) {
        self.master_version = master_version;
    }

    /// Marks the group as removed for the current user
    pub fn mark_removed(&mut self) {
        self.removed_from_group = true;
    }

    /// Flags that the server has changes this client has not seen
    pub fn mark_sync_needed(&mut self) {
        self.sync_needed = true;
    }

    /// Clears the sync-needed flag after a clean pass
    pub fn clear_sync_needed(&mut self) {
        self.sync_needed = false;
    }
}
