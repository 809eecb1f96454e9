//! Session manager
//!
//! Produces a currently-valid access token on demand. The session record is
//! the single piece of shared mutable state between the manager and its
//! callers; it is read and written only through the manager's operations.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::auth_api::{AuthApi, AuthError};
use super::models::{Session, SessionUser};
use super::store::SessionStore;
use super::token::{is_token_expired, parse_user_from_jwt, TOKEN_REFRESH_BUFFER_SECONDS};

type RefreshFuture = Shared<BoxFuture<'static, Option<Session>>>;

/// Owns the authenticated session.
///
/// Cheap to clone; clones share the same session state. All remote-call
/// failures inside refresh degrade to "no session": an absent result from
/// [`get_access_token`](SessionManager::get_access_token) means "operate in
/// local-only mode", never a fatal error.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    auth: Arc<dyn AuthApi>,
    session: RwLock<Option<Session>>,
    loading: AtomicBool,
    refresh_in_flight: Mutex<Option<RefreshFuture>>,
}

/// Magic-link tokens carried in a URL fragment.
struct FragmentTokens {
    access_token: String,
    refresh_token: Option<String>,
}

fn parse_fragment_tokens(fragment: &str) -> Option<FragmentTokens> {
    let mut access_token = None;
    let mut refresh_token = None;

    for pair in fragment.trim_start_matches('#').split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        match key {
            "access_token" => access_token = Some(value),
            "refresh_token" => refresh_token = Some(value),
            _ => {}
        }
    }

    access_token.map(|access_token| FragmentTokens {
        access_token,
        refresh_token,
    })
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, auth: Arc<dyn AuthApi>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                auth,
                session: RwLock::new(None),
                loading: AtomicBool::new(true),
                refresh_in_flight: Mutex::new(None),
            }),
        }
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.session().map(|s| s.user)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// True until [`initialize`](SessionManager::initialize) has completed.
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    fn set_session(&self, value: Option<Session>) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Bootstraps the session on process start.
    ///
    /// `location_fragment` is the URL fragment the host shell observed at
    /// launch (with or without the leading `#`). When it carries magic-link
    /// tokens the session is adopted from them and `true` is returned: the
    /// caller must then strip the fragment from the visible location so it is
    /// neither kept in navigation history nor re-processed on reload. The
    /// fragment is reported consumed even when its token turns out to be
    /// undecodable.
    ///
    /// Without usable fragment tokens, a persisted session is loaded; if its
    /// access token is stale one refresh is attempted, otherwise it is adopted
    /// as-is. Concludes by dropping the loading flag exactly once.
    pub async fn initialize(&self, location_fragment: Option<&str>) -> bool {
        let consumed = self.adopt_magic_link(location_fragment).await;
        if !consumed {
            self.restore_persisted().await;
        }
        self.inner.loading.store(false, Ordering::SeqCst);
        debug!("session bootstrap complete");
        consumed
    }

    async fn adopt_magic_link(&self, fragment: Option<&str>) -> bool {
        let Some(fragment) = fragment else {
            return false;
        };
        let Some(tokens) = parse_fragment_tokens(fragment) else {
            return false;
        };

        match parse_user_from_jwt(&tokens.access_token) {
            Some(user) => {
                let session = Session {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    user: user.clone(),
                };
                if let Err(error) = self.inner.store.save(&session).await {
                    warn!(error = %error, "failed to persist magic-link session");
                }
                self.set_session(Some(session));
                info!(user_id = %user.id, "signed in via magic link");
            }
            None => {
                warn!("magic-link access token has no subject claim, ignoring");
            }
        }

        // The fragment must be stripped either way.
        true
    }

    async fn restore_persisted(&self) {
        match self.inner.store.load().await {
            Ok(None) => {}
            Ok(Some(stored)) => {
                if is_token_expired(&stored.access_token, TOKEN_REFRESH_BUFFER_SECONDS) {
                    self.refresh_session(stored.refresh_token).await;
                } else {
                    debug!(user_id = %stored.user.id, "restored persisted session");
                    self.set_session(Some(stored));
                }
            }
            Err(error) => {
                warn!(error = %error, "stored session unreadable, clearing");
                self.clear_session().await;
            }
        }
    }

    /// Returns an access token that is not expiring within the look-ahead
    /// buffer, refreshing first when needed. `None` means local-only mode.
    pub async fn get_access_token(&self) -> Option<String> {
        let active = self.session()?;

        if is_token_expired(&active.access_token, TOKEN_REFRESH_BUFFER_SECONDS) {
            return self
                .refresh_session(active.refresh_token)
                .await
                .map(|s| s.access_token);
        }

        Some(active.access_token)
    }

    /// Exchanges `refresh_token` for a fresh session.
    ///
    /// Single-flight: callers arriving while an exchange is in progress attach
    /// to the same pending result instead of issuing duplicate network calls.
    /// The exchange itself clears the in-flight slot when it settles, so a
    /// caller dropped mid-await cannot wedge the marker. Any failure (missing
    /// token, unconfigured endpoint, rejection, unparseable subject) clears
    /// the session entirely and returns `None` - never a half-updated session.
    pub async fn refresh_session(&self, refresh_token: Option<String>) -> Option<Session> {
        if !self.inner.auth.is_configured() {
            self.clear_session().await;
            return None;
        }
        let Some(refresh_token) = refresh_token else {
            self.clear_session().await;
            return None;
        };

        let future = {
            let mut slot = self
                .inner
                .refresh_in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let manager = self.clone();
                    let future = async move {
                        let result = manager.perform_refresh(refresh_token).await;
                        // The slot holds this future until this line runs, so
                        // an unconditional clear cannot drop a newer exchange.
                        *manager
                            .inner
                            .refresh_in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };

        future.await
    }

    async fn perform_refresh(&self, refresh_token: String) -> Option<Session> {
        let pair = match self.inner.auth.exchange_refresh_token(&refresh_token).await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(error = %error, "refresh token exchange failed, dropping session");
                self.clear_session().await;
                return None;
            }
        };

        let Some(user) = parse_user_from_jwt(&pair.access_token) else {
            warn!("refreshed access token has no subject claim, dropping session");
            self.clear_session().await;
            return None;
        };

        let session = Session {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            user: user.clone(),
        };

        if let Err(error) = self.inner.store.save(&session).await {
            warn!(error = %error, "failed to persist refreshed session");
        }
        self.set_session(Some(session.clone()));
        debug!(user_id = %user.id, "session refreshed");

        Some(session)
    }

    /// Requests a magic link for `email`. Performs no session mutation.
    pub async fn sign_in_with_otp(&self, email: &str) -> Result<(), AuthError> {
        self.inner.auth.request_otp(email).await
    }

    /// Clears the session and invalidates the local document cache.
    pub async fn sign_out(&self) {
        info!("signing out");
        self.clear_session().await;
    }

    async fn clear_session(&self) {
        self.set_session(None);
        if let Err(error) = self.inner.store.clear().await {
            warn!(error = %error, "failed to clear persisted session");
        }
        // Cached diagrams belong to the previous identity; removal is
        // best-effort and must not block the clear.
        if let Err(error) = self.inner.store.invalidate_document_cache().await {
            debug!(error = %error, "document cache invalidation failed");
        }
    }
}
