//! Integration tests for groupsync-sync
//!
//! Drives the sync orchestrator against an in-memory server that enforces
//! master versions, and verifies uploads, downloads, conflict decisions and
//! crash recovery end to end.


mod test_downloads;
mod test_lifecycle;
mod test_uploads;
