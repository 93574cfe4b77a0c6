//! Error types for the conflict engine

use thiserror::Error;

use groupsync_core::domain::DomainError;

/// Errors that can occur during conflict detection and resolution
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No pending decision with this identifier
    #[error("conflict decision not found: {0}")]
    NotFound(String),

    /// A deletion resolution was given for a content conflict or vice versa
    #[error("resolution does not match the kind of decision {0}")]
    ResolutionKindMismatch(String),

    /// Metadata cannot bring back content the server has deleted
    #[error("cannot keep a metadata-only upload for {file}: only content can undo a deletion")]
    CannotUndeleteWithAppMetaDataOnly { file: String },

    /// Unknown default strategy name
    #[error("invalid conflict strategy '{0}'; valid: manual, accept_remote, keep_local")]
    InvalidStrategy(String),

    /// Domain rule violated while applying a resolution
    #[error(transparent)]
    Domain(#[from] DomainError),
}
