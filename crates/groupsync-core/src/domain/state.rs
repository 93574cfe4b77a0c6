//! Aggregate sync state and the transaction wrapper around it
//!
//! [`SyncState`] holds every persisted entity. All mutation goes through a
//! [`StateTransaction`]: a working copy that is checked against the
//! cross-entity invariants and written to the store as a whole on commit,
//! or simply dropped on rollback.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::{Deref, DerefMut};

use super::conflict::PendingDecision;
use super::directory::Directory;
use super::download::DownloadGroups;
use super::errors::DomainError;
use super::network_cache::NetworkResultCache;
use super::newtypes::{DecisionId, DownloadGroupId, FileUuid, SharingGroupId};
use super::sharing_group::SharingGroup;
use super::upload::UploadQueues;
use crate::ports::state_store::IStateStore;

/// Everything the engine persists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub sharing_groups: BTreeMap<SharingGroupId, SharingGroup>,
    pub directory: Directory,
    pub upload_queues: UploadQueues,
    pub download_groups: DownloadGroups,
    pub network_cache: NetworkResultCache,
    pub decisions: Vec<PendingDecision>,
    /// Sharing groups with a requested sync, oldest first
    pub sync_requests: VecDeque<SharingGroupId>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sharing_group(&self, id: &SharingGroupId) -> Option<&SharingGroup> {
        self.sharing_groups.get(id)
    }

    pub fn sharing_group_mut(&mut self, id: &SharingGroupId) -> Option<&mut SharingGroup> {
        self.sharing_groups.get_mut(id)
    }

    pub fn decision(&self, id: &DecisionId) -> Option<&PendingDecision> {
        self.decisions.iter().find(|d| d.id() == id)
    }

    /// Decisions that still hold back a download group
    pub fn decisions_for_group<'a>(
        &'a self,
        group_id: &'a DownloadGroupId,
    ) -> impl Iterator<Item = &'a PendingDecision> + 'a {
        self.decisions.iter().filter(move |d| d.group_id() == group_id)
    }

    /// Returns true if an undecided conflict covers the file
    pub fn has_decision_for_file(&self, file_uuid: &FileUuid) -> bool {
        self.decisions.iter().any(|d| d.files().contains(file_uuid))
    }

    /// Verifies the invariants that span more than one entity
    ///
    /// # Errors
    /// Returns `DomainError::InvariantViolated` naming the first broken rule.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        let violated = |msg: String| Err(DomainError::InvariantViolated(msg));

        for entry in self.directory.iter() {
            if !self.sharing_groups.contains_key(entry.sharing_group_id()) {
                return violated(format!(
                    "directory entry {} references unknown sharing group {}",
                    entry.file_uuid(),
                    entry.sharing_group_id()
                ));
            }
        }

        if let Some(pending) = &self.upload_queues.pending {
            if pending.done_uploads_sent().is_some() {
                return violated(format!("pending batch {} was already finished", pending.id()));
            }
        }

        for queue in self.upload_queues.all() {
            if !self.sharing_groups.contains_key(queue.sharing_group_id()) {
                return violated(format!(
                    "upload batch {} references unknown sharing group {}",
                    queue.id(),
                    queue.sharing_group_id()
                ));
            }
            let mut seen = BTreeSet::new();
            for tracker in &queue.trackers {
                if &tracker.sharing_group_id != queue.sharing_group_id() {
                    return violated(format!(
                        "tracker {} in batch {} belongs to sharing group {}",
                        tracker.id(),
                        queue.id(),
                        tracker.sharing_group_id
                    ));
                }
                if !seen.insert(tracker.file_uuid) {
                    return violated(format!(
                        "batch {} holds more than one tracker for file {}",
                        queue.id(),
                        tracker.file_uuid
                    ));
                }
            }
        }

        for tracker in self.download_groups.trackers() {
            let Some(group) = self.download_groups.group(tracker.group_id()) else {
                return violated(format!(
                    "download tracker {} references missing group {}",
                    tracker.id(),
                    tracker.group_id()
                ));
            };
            if group.sharing_group_id() != &tracker.sharing_group_id {
                return violated(format!(
                    "download tracker {} is in group {} of another sharing group",
                    tracker.id(),
                    group.id()
                ));
            }
        }

        for decision in &self.decisions {
            if self.download_groups.group(decision.group_id()).is_none() {
                return violated(format!(
                    "decision {} references missing download group {}",
                    decision.id(),
                    decision.group_id()
                ));
            }
        }

        Ok(())
    }
}

/// A working copy of the state that is committed or discarded as a whole
#[derive(Debug)]
pub struct StateTransaction {
    working: SyncState,
}

impl StateTransaction {
    /// Starts a transaction from the current state
    pub fn begin(state: &SyncState) -> Self {
        Self {
            working: state.clone(),
        }
    }

    /// Checks invariants and persists the working copy
    ///
    /// On success the committed state is returned so the caller can adopt
    /// it. On failure nothing has been written and the caller's state is
    /// unchanged.
    pub async fn commit(self, store: &dyn IStateStore) -> anyhow::Result<SyncState> {
        self.working.check_invariants()?;
        store.save(&self.working).await?;
        Ok(self.working)
    }

    /// Discards the working copy
    pub fn rollback(self) {}
}

impl Deref for StateTransaction {
    type Target = SyncState;

    fn deref(&self) -> &SyncState {
        &self.working
    }
}

impl DerefMut for StateTransaction {
    fn deref_mut(&mut self) -> &mut SyncState {
        &mut self.working
    }
}
