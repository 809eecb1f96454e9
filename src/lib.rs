//! Session lifecycle and cloud reconciliation engine for a diagram editor.
//!
//! Two components, the second depending on the first:
//!
//! - [`SessionManager`] owns the authenticated session: it adopts magic-link
//!   tokens, derives the user identity from the access token's claims, and
//!   refreshes stale tokens with at most one exchange in flight at a time.
//! - [`SyncOrchestrator`] watches a document feed for edits, debounces bursts
//!   into a single remote write, and mirrors the full document tree (header
//!   plus six child-entity collections) to a row-level REST store using a
//!   replace-all strategy with a permission-failure fallback.
//!
//! The editing layer, local persistence and remote endpoints are all reached
//! through boundary traits ([`SessionStore`], [`AuthApi`],
//! [`sync::RestTransport`]) so hosts can plug in their own storage and tests
//! can run without a network.

pub mod common;
pub mod session;
pub mod sync;

pub use common::RemoteConfig;
pub use session::{AuthApi, AuthError, Session, SessionManager, SessionStore, SessionUser};
pub use sync::{
    CloudStore, DatabaseType, Diagram, DiagramEntity, RemoteError, SyncOrchestrator, SyncState,
    SyncStatus,
};
