//! Sync scheduler - request FIFO and cooperative stop flag
//!
//! The [`SyncScheduler`] is the part of the orchestrator that may be shared
//! across tasks. Other tasks record sync requests and stop requests here;
//! the orchestrator drains them between steps of a pass.
//!
//! ## Flow
//!
//! ```text
//! caller ──→ request_sync(sg) ──→ FIFO ──→ orchestrator (between passes)
//! caller ──→ request_stop()   ──→ flag ──→ orchestrator (between steps)
//! ```
//!
//! A requested sync for a group that is already waiting is not queued twice.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{debug, info};

use groupsync_core::domain::SharingGroupId;

/// Shared handle for requesting syncs and stopping a running pass
#[derive(Debug, Clone, Default)]
pub struct SyncScheduler {
    /// Requests received while a pass was running, oldest first
    requests: Arc<Mutex<VecDeque<SharingGroupId>>>,
    /// Set to ask the running pass to stop at the next step boundary
    stop_requested: Arc<AtomicBool>,
    /// True while a pass is running
    active: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a sync request
    ///
    /// Returns `false` if the sharing group was already waiting.
    pub fn request_sync(&self, sharing_group_id: SharingGroupId) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if requests.contains(&sharing_group_id) {
            debug!(sharing_group = %sharing_group_id, "Sync already requested");
            return false;
        }
        requests.push_back(sharing_group_id);
        info!(sharing_group = %sharing_group_id, waiting = requests.len(), "Sync requested");
        true
    }

    /// Drains every queued request
    pub fn take_requests(&self) -> Vec<SharingGroupId> {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.drain(..).collect()
    }

    /// Asks the running pass to stop
    ///
    /// The pass finishes the transfer in flight, commits, and fires
    /// `sync_stopping`. A later `sync` resumes from the persisted state.
    pub fn request_stop(&self) {
        info!("Sync stop requested");
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Returns true while a sync pass is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

// ============================================================================
// Unit tests
// ============================================================================
