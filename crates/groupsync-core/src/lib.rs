//! groupsync Core - Domain logic and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `SharingGroup`, `DirectoryEntry`, upload and download
//!   trackers, `NetworkResultCache`, conflict decisions, `SyncState`
//! - **Port definitions** - Traits for adapters: `IServerApi`, `IStateStore`, `ISyncDelegate`
//! - **Configuration** - YAML configuration with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.
//! The sync crate drives the domain through these ports.

pub mod config;
pub mod domain;
pub mod ports;
