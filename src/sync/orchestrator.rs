//! Sync orchestrator
//!
//! Keeps the remote copy of the active diagram consistent with the local one
//! without blocking the editing experience: edits are observed through a
//! document feed, coalesced behind a trailing debounce window, and pushed with
//! the replace-all strategy of [`CloudStore`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

use super::models::{Diagram, DocumentFingerprint, SyncState, SyncStatus};
use super::remote::{CloudStore, RemoteError};
use crate::session::SessionManager;

/// Trailing debounce applied to bursts of document edits; only the last edit
/// in a burst triggers a network round trip.
pub const AUTO_SYNC_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Receiver side of the editing layer's document feed. The sender publishes a
/// fresh snapshot whenever the local diagram changes; `None` means no active
/// document.
pub type DocumentWatch = watch::Receiver<Option<Diagram>>;

/// Watches the document feed and mirrors the diagram to the cloud.
///
/// Cheap to clone; clones share state. Status, last sync time and the current
/// error are published through a [`watch`] channel so the UI can both poll
/// and subscribe.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    session: SessionManager,
    cloud: CloudStore,
    documents: DocumentWatch,
    state: watch::Sender<SyncState>,
}

impl SyncOrchestrator {
    pub fn new(session: SessionManager, cloud: CloudStore, documents: DocumentWatch) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            inner: Arc::new(Inner {
                session,
                cloud,
                documents,
                state,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.borrow().status
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().last_synced_at
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    fn update(&self, apply: impl FnOnce(&mut SyncState)) {
        self.inner.state.send_modify(apply);
    }

    /// Spawns the change-watcher task. It runs until the document feed's
    /// sender is dropped.
    pub fn spawn(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run().await })
    }

    async fn run(&self) {
        let mut documents = self.inner.documents.clone();
        let mut fingerprint: Option<DocumentFingerprint> = None;
        let mut deadline: Option<Instant> = None;

        // The snapshot present at startup counts as the first change.
        let initial = documents.borrow_and_update().clone();
        self.observe(initial, &mut fingerprint, &mut deadline);

        loop {
            tokio::select! {
                changed = documents.changed() => {
                    if changed.is_err() {
                        debug!("document feed closed, stopping sync watcher");
                        break;
                    }
                    let snapshot = documents.borrow_and_update().clone();
                    self.observe(snapshot, &mut fingerprint, &mut deadline);
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    deadline = None;
                    // Run the attempt off the loop so a change arriving while
                    // it is in flight is observed immediately. The attempt is
                    // never cancelled; a later attempt simply supersedes its
                    // result.
                    let orchestrator = self.clone();
                    tokio::spawn(async move { orchestrator.trigger_sync().await });
                }
            }
        }
    }

    /// Authentication is sampled only when the feed ticks: a sign-out takes
    /// effect at the next document change, not immediately.
    fn observe(
        &self,
        snapshot: Option<Diagram>,
        fingerprint: &mut Option<DocumentFingerprint>,
        deadline: &mut Option<Instant>,
    ) {
        match snapshot {
            Some(diagram) if self.inner.session.is_authenticated() => {
                let next = DocumentFingerprint::of(&diagram);
                if fingerprint.as_ref() != Some(&next) {
                    *fingerprint = Some(next);
                    self.update(|state| state.status = SyncStatus::Pending);
                    *deadline = Some(Instant::now() + AUTO_SYNC_DEBOUNCE);
                }
            }
            // No document or no identity: nothing to sync.
            _ => {
                *fingerprint = None;
                *deadline = None;
                self.update(|state| {
                    state.status = SyncStatus::Idle;
                    state.error = None;
                });
            }
        }
    }

    /// Runs one sync attempt immediately, bypassing the debounce window.
    ///
    /// Settles to `Idle` with no error and no network activity when there is
    /// no authenticated user or no active document.
    pub async fn trigger_sync(&self) {
        let user = self.inner.session.user();
        let snapshot = self.inner.documents.borrow().clone();
        let (Some(user), Some(diagram)) = (user, snapshot) else {
            self.update(|state| {
                state.status = SyncStatus::Idle;
                state.error = None;
            });
            return;
        };

        self.update(|state| {
            state.status = SyncStatus::Syncing;
            state.error = None;
        });

        let access_token = self.inner.session.get_access_token().await;
        match self
            .inner
            .cloud
            .sync_diagram(&diagram, &user.id, access_token.as_deref())
            .await
        {
            Ok(()) => {
                debug!(diagram_id = %diagram.id, "sync attempt finished");
                self.update(|state| {
                    state.status = SyncStatus::Synced;
                    state.last_synced_at = Some(Utc::now());
                });
            }
            Err(error) => {
                warn!(diagram_id = %diagram.id, error = %error, "sync attempt failed");
                self.update(|state| {
                    state.status = SyncStatus::Error;
                    state.error = Some(error.to_string());
                });
            }
        }
    }

    /// Removes a diagram from the remote store; no-op without a session.
    pub async fn delete_diagram_from_cloud(&self, diagram_id: &str) -> Result<(), RemoteError> {
        let Some(user) = self.inner.session.user() else {
            return Ok(());
        };
        let access_token = self.inner.session.get_access_token().await;
        self.inner
            .cloud
            .delete_diagram(diagram_id, &user.id, access_token.as_deref())
            .await
    }

    /// Reads back the signed-in user's diagrams; empty without a session or
    /// token.
    pub async fn fetch_diagrams(&self) -> Result<Vec<Diagram>, RemoteError> {
        let Some(user) = self.inner.session.user() else {
            return Ok(Vec::new());
        };
        let Some(access_token) = self.inner.session.get_access_token().await else {
            return Ok(Vec::new());
        };
        self.inner.cloud.fetch_diagrams(&user.id, &access_token).await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        // Guarded by `if deadline.is_some()` at the select; never polled.
        None => std::future::pending().await,
    }
}
