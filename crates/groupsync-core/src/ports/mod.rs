//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates or in the
//! embedding application.
//!
//! ## Ports Overview
//!
//! - [`IServerApi`] - Calls against the sync server
//! - [`IStateStore`] - Persistent storage for the sync state
//! - [`ISyncDelegate`] - Lifecycle events and conflict decisions for the collaborator

pub mod server_api;
pub mod state_store;
pub mod sync_delegate;

pub use server_api::{
    DownloadRequest, FileDownload, FileIndex, IServerApi, InvitationInfo, Permission,
    RedeemedInvitation, RemoteFileInfo, RemoteSharingGroup, ServerResponse,
    UploadAppMetaDataRequest, UploadDeletionRequest, UploadFileRequest,
};
pub use state_store::IStateStore;
pub use sync_delegate::{DeliveredFile, DeliveredGroup, ISyncDelegate, NoopDelegate};
