//! groupsync Conflict - Conflict detection and resolution
//!
//! Provides:
//! - Detection of remote changes that collide with queued local work
//! - Pending decisions, one per download group for deletions and one per
//!   file for content changes
//! - Application of resolutions to the upload queues and download groups
//! - Automatic answers from the configured default strategy

pub mod detector;
pub mod error;
pub mod policy;
pub mod resolver;

pub use detector::ConflictDetector;
pub use error::ConflictError;
pub use policy::ConflictPolicy;
pub use resolver::ConflictResolver;
