//! On-disk session store.
//!
//! Layout, one directory per session id under the session root:
//!
//! ```text
//! <session_dir>/<session_id>/
//!   pause.json       single checkpoint record
//!   metrics.json     token totals, compaction events, turn counters
//!   transcript.log   append-only prompts + responses
//! ```
//!
//! The root comes from `SDQCTL_SESSION_DIR`, defaulting to
//! `~/.sdqctl/sessions`.

use super::checkpoint::Checkpoint;
use super::metrics::SessionMetrics;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const SESSION_DIR_ENV: &str = "SDQCTL_SESSION_DIR";
pub const TRANSCRIPT_FILE: &str = "transcript.log";

/// A listed session with whatever state is on disk.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub id: String,
    pub checkpoint: Option<Checkpoint>,
    pub metrics: Option<SessionMetrics>,
}

impl StoredSession {
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.metrics
            .as_ref()
            .map(|m| m.modified_at)
            .or_else(|| self.checkpoint.as_ref().map(|c| c.timestamp))
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the store root from the environment, falling back to
    /// `~/.sdqctl/sessions`.
    pub fn from_env() -> Result<Self> {
        if let Ok(dir) = std::env::var(SESSION_DIR_ENV) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".sdqctl").join("sessions")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn create_session_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn list(&self) -> Result<Vec<StoredSession>> {
        let mut sessions = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            sessions.push(self.load(&id)?);
        }
        sessions.sort_by_key(|s| std::cmp::Reverse(s.modified_at()));
        Ok(sessions)
    }

    pub fn load(&self, id: &str) -> Result<StoredSession> {
        let dir = self.session_dir(id);
        let checkpoint = Checkpoint::load(&dir).ok();
        let metrics = SessionMetrics::load(&dir).ok();
        Ok(StoredSession {
            id: id.to_string(),
            checkpoint,
            metrics,
        })
    }

    /// Load a session that must exist on disk.
    pub fn load_existing(&self, id: &str) -> Result<StoredSession> {
        if !self.session_dir(id).is_dir() {
            return Err(Error::UnknownSession(id.to_string()));
        }
        self.load(id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(Error::UnknownSession(id.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        debug!("deleted session {id}");
        Ok(())
    }

    /// Remove sessions whose last activity is older than `age`. Returns the
    /// ids that were (or with `dry_run` would be) removed.
    pub fn cleanup(&self, age: Duration, dry_run: bool) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|e| Error::Validation(format!("bad cleanup age: {e}")))?;
        let mut removed = Vec::new();
        for session in self.list()? {
            let stale = match session.modified_at() {
                Some(ts) => ts < cutoff,
                // A directory with neither checkpoint nor metrics is debris.
                None => true,
            };
            if stale {
                if !dry_run {
                    std::fs::remove_dir_all(self.session_dir(&session.id))?;
                } else {
                    warn!("would remove stale session {}", session.id);
                }
                removed.push(session.id);
            }
        }
        Ok(removed)
    }

    /// Append a prompt/response pair to the session transcript.
    pub fn append_transcript(&self, id: &str, prompt: &str, response: &str) -> Result<()> {
        let dir = self.create_session_dir(id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRANSCRIPT_FILE))?;
        writeln!(file, ">>> {}", prompt.replace('\n', "\n>>> "))?;
        writeln!(file, "<<< {}", response.replace('\n', "\n<<< "))?;
        Ok(())
    }
}
