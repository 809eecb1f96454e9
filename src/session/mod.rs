//! # Session module
//!
//! Owns the authenticated session:
//! - magic-link token adoption and session persistence
//! - user identity derived from the access token's claims
//! - token staleness checks and single-flight refresh
//! - one-time-password (magic link) sign-in requests

pub mod auth_api;
pub mod manager;
pub mod models;
pub mod store;
pub mod token;


pub use auth_api::{AuthApi, AuthError, SupabaseAuthApi};
pub use manager::SessionManager;
pub use models::{Session, SessionUser, TokenPair};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError, SESSION_STORAGE_KEY};
pub use token::{is_token_expired, parse_user_from_jwt, TOKEN_REFRESH_BUFFER_SECONDS};
