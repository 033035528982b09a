//! Authenticated session persistence.
//!
//! The handle is opaque to the engine: whatever the automation surface needs to
//! resume a logged-in context (cookies, profile markers) lives in `token`. It is
//! written with temp file + fsync + rename so a crash never leaves a half-written
//! session behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Opaque authenticated-context token reused across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub token: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(token: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            token,
            created_at: now,
            refreshed_at: now,
        }
    }

    /// Replace the token after the surface re-validated the login.
    pub fn refresh(&mut self, token: serde_json::Value) {
        self.token = token;
        self.refreshed_at = Utc::now();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persists the session handle between runs.
pub trait SessionStore: Send {
    /// `Ok(None)` when no session was ever saved.
    fn load(&self) -> Result<Option<SessionHandle>, SessionError>;
    fn save(&self, handle: &SessionHandle) -> Result<(), SessionError>;
    /// Forget an invalidated session so the next bootstrap logs in again.
    fn clear(&self) -> Result<(), SessionError>;
}

/// Single JSON file session store.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionHandle>, SessionError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved session");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(None);
        }
        let handle: SessionHandle = serde_json::from_str(&data)?;
        info!(
            path = %self.path.display(),
            refreshed_at = %handle.refreshed_at,
            "session loaded"
        );
        Ok(Some(handle))
    }

    fn save(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.tmp_path();
        let data = serde_json::to_vec_pretty(handle)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        info!(path = %self.path.display(), "session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
