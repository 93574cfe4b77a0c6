//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and
//! version counters. Each identifier wraps a UUID so that a file identity can
//! never be passed where a sharing group is expected.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Create a nil (all zeros) identifier
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    DomainError::InvalidId(format!("Invalid {}: {e}", stringify!($name)))
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a sharing group (the master-version consistency scope)
    SharingGroupId
);

uuid_id!(
    /// Immutable identity of a file across all of its versions
    FileUuid
);

uuid_id!(
    /// Application-defined grouping of files delivered atomically on download
    FileGroupUuid
);

uuid_id!(
    /// Identifier of an upload batch
    QueueId
);

uuid_id!(
    /// Identifier of an upload or download file tracker
    TrackerId
);

uuid_id!(
    /// Identifier of a download content group
    DownloadGroupId
);

uuid_id!(
    /// Identifier of a pending conflict decision
    DecisionId
);

// ============================================================================
// Version counters
// ============================================================================

/// Version of a file's content; starts at 0 for the first upload
pub type FileVersion = u64;

/// Version of a file's application metadata; independent of the content version
pub type AppMetaDataVersion = u64;

/// Per-sharing-group monotonic counter used for optimistic concurrency
///
/// Every batch-completing server call carries the version the client
/// believes is current. The server validates it and increments it
/// atomically on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterVersion(u64);

impl MasterVersion {
    /// Creates a master version from a raw counter value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version the server moves to after a successful batch
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for MasterVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MasterVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Gone reasons
// ============================================================================

/// Terminal, non-retryable reason the server gives for an unreachable file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoneReason {
    /// The underlying object was removed or renamed in cloud storage
    FileRemovedOrRenamed,
    /// The owning user's cloud storage credentials expired or were revoked
    AuthTokenExpiredOrRevoked,
    /// The owning user was removed from the system
    UserRemoved,
}

impl Display for GoneReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            GoneReason::FileRemovedOrRenamed => "file_removed_or_renamed",
            GoneReason::AuthTokenExpiredOrRevoked => "auth_token_expired_or_revoked",
            GoneReason::UserRemoved => "user_removed",
        };
        write!(f, "{}", s)
    }
}
