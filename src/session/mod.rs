//! Per-conversation runtime state.
//!
//! A session owns one persistent conversation with an assistant backend:
//! the adapter-minted durable id, cycle and step position, the token
//! window as last reported by the adapter, rolling turn statistics, the
//! compaction history, and the stop-file escape hatch. State is mutated
//! only by the engine and step executors, single-threaded per session.

pub mod checkpoint;
pub mod loop_guard;
pub mod metrics;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use loop_guard::LoopGuard;
pub use metrics::{CompactionEvent, RateEstimator, SessionMetrics};
pub use store::SessionStore;

use crate::adapter::{ContextUsage, SendResponse};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The session state machine.
///
/// `Initialized → Running ⇄ Compacting`, with durable suspensions to
/// `Paused`/`Consulting`, terminal `Completed`, and `Error` terminal until
/// resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Initialized,
    Running,
    Compacting,
    Paused,
    Consulting,
    Error,
    Completed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed)
    }

    fn may_transition(self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, to),
            (Initialized, Running)
                | (Running, Compacting)
                | (Compacting, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Consulting)
                | (Consulting, Running)
                | (Running, Completed)
                | (_, Error)
                | (Error, Running)
        )
    }
}

/// Runtime state for one conversation.
#[derive(Debug, Clone)]
pub struct Session {
    /// Durable id assigned by the adapter at creation.
    pub id: String,
    pub name: Option<String>,
    /// 1-based; increases monotonically.
    pub cycle: u32,
    pub step_index: usize,
    pub phase: SessionPhase,
    /// Context window, adapter-reported after every send and compaction.
    pub used_tokens: u64,
    pub max_tokens: u64,
    pub metrics: SessionMetrics,
    pub rate: RateEstimator,
    /// Existence of this file terminates the session at the next safe point.
    pub stop_file: PathBuf,
    /// Per-session state directory holding pause.json and metrics.json.
    pub dir: PathBuf,
}

impl Session {
    pub fn new(id: impl Into<String>, dir: PathBuf) -> Self {
        let id = id.into();
        let stop_file = dir.join(format!("{id}.stop"));
        Self {
            id,
            name: None,
            cycle: 1,
            step_index: 0,
            phase: SessionPhase::Initialized,
            used_tokens: 0,
            max_tokens: 0,
            metrics: SessionMetrics::new(),
            rate: RateEstimator::default(),
            stop_file,
            dir,
        }
    }

    /// Transition the state machine, rejecting invalid edges.
    pub fn transition(&mut self, to: SessionPhase) -> Result<()> {
        if !self.phase.may_transition(to) {
            return Err(Error::Internal(format!(
                "invalid session transition {:?} -> {to:?}",
                self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }

    /// Advance to the next cycle. Cycle numbers only ever increase.
    pub fn next_cycle(&mut self) {
        self.cycle += 1;
        self.step_index = 0;
    }

    /// Overwrite the token window with the adapter-reported value. The
    /// adapter is the source of truth; no local estimate survives this.
    pub fn sync_usage(&mut self, usage: &ContextUsage) {
        self.used_tokens = usage.used;
        self.max_tokens = usage.max;
    }

    /// Fold one completed turn into session statistics.
    pub fn record_turn(&mut self, response: &SendResponse) {
        self.sync_usage(&response.usage);
        self.metrics.record_turn(response);
        self.rate
            .record(response.tokens_in + response.tokens_out);
    }

    /// Percentage of the context window in use, 0 when the window is
    /// unknown.
    pub fn percent_used(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.used_tokens as f64 / self.max_tokens as f64) * 100.0
    }

    /// Whether the agent has requested a stop via the stop file.
    pub fn stop_requested(&self) -> bool {
        self.stop_file.exists()
    }

    /// Cumulative-compaction advisory: when three or more compactions have
    /// together removed nothing, preservation is eating the benefit.
    pub fn compaction_ineffective(&self) -> Option<String> {
        let events = &self.metrics.compactions;
        if events.len() < 3 {
            return None;
        }
        let before: u64 = events.iter().map(|e| e.before).sum();
        let after: u64 = events.iter().map(|e| e.after).sum();
        if before > 0 && after >= before {
            Some(format!(
                "compaction is ineffective: {after} tokens after vs {before} before across {} events; \
                 consider narrowing COMPACT-PRESERVE",
                events.len()
            ))
        } else {
            None
        }
    }
}
