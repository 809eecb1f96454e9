//! Local persistence boundary for the session record

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use super::models::Session;

/// Well-known key the serialized session record lives under.
pub const SESSION_STORAGE_KEY: &str = "chartdb.supabase.session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("stored session is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Get/set/remove of the single session record, plus invalidation of the
/// editor's local document cache (the cached diagrams belong to the previous
/// identity once the session goes away).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>, StoreError>;
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;

    /// Best-effort cleanup; callers log and swallow failures.
    async fn invalidate_document_cache(&self) -> Result<(), StoreError>;
}

/// Volatile store for hosts without persistence (and for local-only mode).
#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.slot().clone())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        *self.slot() = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.slot() = None;
        Ok(())
    }

    async fn invalidate_document_cache(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// JSON-file store: one record in a well-known file, plus an optional
/// document-cache directory removed wholesale on invalidation.
pub struct FileSessionStore {
    path: PathBuf,
    document_cache_dir: Option<PathBuf>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document_cache_dir: None,
        }
    }

    /// Places the record under `dir` using the well-known storage key.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir.into().join(format!("{SESSION_STORAGE_KEY}.json")))
    }

    pub fn with_document_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.document_cache_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let session = serde_json::from_slice(&raw)?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec(session)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn invalidate_document_cache(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.document_cache_dir else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "document cache removed");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
