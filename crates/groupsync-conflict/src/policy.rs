//! Policy engine for automatic conflict resolution
//!
//! Maps the configured `conflicts.default_strategy` onto an answer for a
//! pending decision. `manual` never answers, leaving the decision to the
//! collaborator.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use groupsync_core::domain::{
    ConflictResolution, ContentDownloadResolution, DecisionKind, DeletionRejection,
    DownloadDeletionResolution, PendingDecision, UploadResolution,
};

use crate::error::ConflictError;

/// Default answer to conflict decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave every decision to the collaborator
    #[default]
    Manual,
    /// Accept every remote change, discarding local work
    AcceptRemote,
    /// Keep local work, superseding remote changes where possible
    KeepLocal,
}

impl FromStr for ConflictPolicy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "accept_remote" => Ok(Self::AcceptRemote),
            "keep_local" => Ok(Self::KeepLocal),
            other => Err(ConflictError::InvalidStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::AcceptRemote => "accept_remote",
            ConflictPolicy::KeepLocal => "keep_local",
        };
        write!(f, "{}", s)
    }
}

impl ConflictPolicy {
    /// Parses a configured strategy, falling back to `Manual` when unknown
    pub fn from_config(strategy: &str) -> Self {
        strategy.parse().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Unknown conflict strategy, using manual");
            Self::Manual
        })
    }

    /// Answers a decision, or `None` when it must be left pending
    pub fn decide(&self, decision: &PendingDecision) -> Option<ConflictResolution> {
        let answer = match (self, decision.kind()) {
            (ConflictPolicy::Manual, _) => None,
            (ConflictPolicy::AcceptRemote, DecisionKind::DownloadDeletion(_)) => {
                Some(DownloadDeletionResolution::AcceptDownloadDeletion.into())
            }
            (ConflictPolicy::AcceptRemote, DecisionKind::ContentDownload(_)) => {
                Some(ContentDownloadResolution::AcceptContentDownload.into())
            }
            (ConflictPolicy::KeepLocal, DecisionKind::DownloadDeletion(conflict)) => {
                // metadata alone cannot undo a deletion
                if conflict
                    .conflicts
                    .iter()
                    .any(|c| c.operation.is_app_meta_data_only())
                {
                    debug!(
                        decision = %decision.id(),
                        "Keep-local cannot answer a metadata-only deletion conflict"
                    );
                    None
                } else {
                    Some(
                        DownloadDeletionResolution::RejectDownloadDeletion(
                            DeletionRejection::KeepContentUpload,
                        )
                        .into(),
                    )
                }
            }
            (ConflictPolicy::KeepLocal, DecisionKind::ContentDownload(_)) => Some(
                ContentDownloadResolution::RejectContentDownload(UploadResolution::KeepAll).into(),
            ),
        };

        trace!(decision = %decision.id(), policy = %self, ?answer, "Policy evaluated");
        answer
    }
}
