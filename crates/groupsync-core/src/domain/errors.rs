//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including identifier parsing failures, invalid tracker transitions and
//! violations of the cross-entity invariants checked before every commit.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// A cross-entity invariant does not hold for the working state
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    /// A download tracker was added to a group of another sharing group
    #[error("Download group {group} belongs to sharing group {expected}, tracker has {actual}")]
    SharingGroupMismatchInGroup {
        /// The download group identifier
        group: String,
        /// Sharing group of the first member
        expected: String,
        /// Sharing group of the rejected tracker
        actual: String,
    },

    /// The file group of a file may not change once recorded
    #[error("File group of {file} is {expected}, cannot change to {actual}")]
    FileGroupChanged {
        /// The file whose group changed
        file: String,
        /// The recorded file group
        expected: String,
        /// The attempted file group
        actual: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
