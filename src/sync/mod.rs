//! # Sync module
//!
//! Keeps a remote copy of the active diagram consistent with the local one:
//! - change detection over the editing layer's document feed
//! - trailing debounce so bursts of edits become one remote write
//! - replace-all reconciliation of the header and six child collections
//! - read-back and deletion of cloud diagrams

pub mod models;
pub mod orchestrator;
pub mod remote;

#[cfg(test)]
mod tests;

pub use models::{
    DatabaseType, Diagram, DiagramEntity, DocumentFingerprint, EntityCollection, SyncState,
    SyncStatus,
};
pub use orchestrator::{DocumentWatch, SyncOrchestrator, AUTO_SYNC_DEBOUNCE};
pub use remote::{CloudStore, HttpTransport, RemoteError, RestTransport, WriteMethod};
