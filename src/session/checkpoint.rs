//! Durable checkpoint records.
//!
//! Each session directory holds at most one `pause.json`. Writes go to a
//! temp file in the same directory followed by an atomic rename, so a
//! reader never observes a torn record.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CHECKPOINT_FILE: &str = "pause.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Running,
    Paused,
    Consulting,
    Error,
}

/// The single durable record enabling resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub workflow_hash: String,
    pub cycle: u32,
    pub step_index: usize,
    pub status: CheckpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_topic: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        session_id: impl Into<String>,
        workflow_hash: impl Into<String>,
        cycle: u32,
        step_index: usize,
        status: CheckpointStatus,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workflow_hash: workflow_hash.into(),
            cycle,
            step_index,
            status,
            message: None,
            consultation_topic: None,
            timestamp: Utc::now(),
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Atomically replace the session's checkpoint.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let target = Self::path_in(dir);
        let temp = target.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&temp, &target)?;
        info!(
            "checkpoint saved for session {} (cycle {}, step {}, {:?})",
            self.session_id, self.cycle, self.step_index, self.status
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Checkpoint> {
        let target = Self::path_in(dir);
        let text = std::fs::read_to_string(&target).map_err(|_| {
            Error::UnknownSession(format!("no checkpoint at {}", target.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path_in(dir).exists()
    }

    /// Delete the checkpoint on normal completion. Missing files are fine.
    pub fn delete(dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path_in(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Age of the record relative to now.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}
