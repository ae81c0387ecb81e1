//! Durable single-document state store.
//!
//! The whole tracker state lives in one JSON document: the active-session
//! index, the ordered mutation queue, the offline flag, the last successful
//! sync time, and a bounded history of ended sessions. The hosting process has
//! no guaranteed lifetime between events, so the document is the only ground
//! truth; anything in memory is a disposable cache rebuilt from here.
//!
//! Writes go through a temp file in the same directory followed by an atomic
//! rename, so a crash mid-save never corrupts the previous document. Loads are
//! defensive: a missing, empty, corrupt or version-mismatched file yields an
//! empty document instead of an error.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

use revclock_core::{PageContext, SyncQueue, TrackingSession};

/// Current document schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Ended sessions retained for local display; oldest evicted beyond this.
const HISTORY_CAP: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize state document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("state file path {0} has no parent directory")]
    NoParent(PathBuf),
}

/// The single durable document owned by the background process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreDocument {
    version: u32,
    /// Active-session index: session id → session. At most one entry per page
    /// context; the registry enforces it through [`StoreDocument::active_for_page`].
    pub sessions: HashMap<String, TrackingSession>,
    pub queue: SyncQueue,
    pub offline: bool,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Ended sessions, newest last, capped at [`HISTORY_CAP`].
    #[serde(default)]
    pub history: Vec<TrackingSession>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            sessions: HashMap::new(),
            queue: SyncQueue::default(),
            offline: false,
            last_sync_at: None,
            history: Vec::new(),
        }
    }
}

impl StoreDocument {
    /// The active session for a page context, if any.
    pub fn active_for_page(&self, context: &PageContext) -> Option<&TrackingSession> {
        self.sessions
            .values()
            .find(|session| session.context.same_page(context))
    }

    /// Looks a session up in the active index first, then in history. The
    /// dispatcher needs the history path: acknowledgments routinely arrive
    /// after the session already ended.
    pub fn session_mut(&mut self, id: &str) -> Option<&mut TrackingSession> {
        if self.sessions.contains_key(id) {
            return self.sessions.get_mut(id);
        }
        self.history.iter_mut().find(|session| session.id == id)
    }

    pub fn session(&self, id: &str) -> Option<&TrackingSession> {
        self.sessions
            .get(id)
            .or_else(|| self.history.iter().find(|session| session.id == id))
    }

    /// Moves an ended session out of the active index into history.
    pub fn retire(&mut self, id: &str) {
        if let Some(session) = self.sessions.remove(id) {
            debug_assert!(session.is_ended());
            self.history.push(session);
            if self.history.len() > HISTORY_CAP {
                let excess = self.history.len() - HISTORY_CAP;
                self.history.drain(..excess);
            }
        }
    }
}

/// Handle to the document's location on disk.
///
/// There is deliberately no cached copy in here: every operation re-reads the
/// freshest persisted state (see the concurrency rules in the daemon crate).
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current document, falling back to an empty one when the file
    /// is missing, empty, corrupt, or carries an unknown schema version.
    pub fn load(&self) -> Result<StoreDocument, StoreError> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;

        if content.trim().is_empty() {
            warn!("empty state file at {}, starting fresh", self.path.display());
            return Ok(StoreDocument::default());
        }

        match serde_json::from_str::<StoreDocument>(&content) {
            Ok(doc) if doc.version == SCHEMA_VERSION => Ok(doc),
            Ok(doc) => {
                warn!(
                    "unsupported state file version {} (expected {}), starting fresh",
                    doc.version, SCHEMA_VERSION
                );
                Ok(StoreDocument::default())
            }
            Err(e) => {
                warn!(
                    "unparseable state file at {} ({e}), starting fresh",
                    self.path.display()
                );
                Ok(StoreDocument::default())
            }
        }
    }

    /// Persists the document atomically: temp file in the same directory,
    /// flush, rename over the target.
    pub fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StoreError::NoParent(self.path.clone()))?;
        std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        let content = serde_json::to_string_pretty(doc)?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        temp.write_all(content.as_bytes())
            .and_then(|()| temp.flush())
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        temp.persist(&self.path).map_err(|e| StoreError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }
}
