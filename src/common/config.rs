// Remote backend configuration

use std::env;

/// Location and public API key of the remote backing store.
///
/// Absent configuration is not an error: every remote operation degrades to a
/// silent no-op and the application keeps working in local-only mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL of the backend, without a trailing slash.
    pub url: String,
    /// Public (anonymous) API key sent with every request.
    pub anon_key: String,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let mut url = url.into();
        while url.ends_with('/') {
            url.pop();
        }
        Self {
            url,
            anon_key: anon_key.into(),
        }
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY` from the environment.
    /// Returns `None` unless both are present and non-empty.
    pub fn from_env() -> Option<Self> {
        let url = env::var("SUPABASE_URL").ok().filter(|v| !v.is_empty())?;
        let anon_key = env::var("SUPABASE_ANON_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self::new(url, anon_key))
    }
}
