//! Session metrics and the token-rate estimator.
//!
//! `metrics.json` accumulates turn and token totals plus the compaction
//! history; the rate estimator keeps a rolling in-memory window to expose
//! tokens/minute and an estimated time-to-limit.

use crate::adapter::SendResponse;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

pub const METRICS_FILE: &str = "metrics.json";

/// One compaction, as recorded in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub before: u64,
    pub after: u64,
    pub preserved: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl CompactionEvent {
    /// after/before; values ≥ 1.0 mean the compaction removed nothing.
    pub fn effectiveness(&self) -> f64 {
        if self.before == 0 {
            return 1.0;
        }
        self.after as f64 / self.before as f64
    }
}

/// Persisted token totals and counters for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub turns: u32,
    pub tool_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub compactions: Vec<CompactionEvent>,
    pub started_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            turns: 0,
            tool_calls: 0,
            tokens_in: 0,
            tokens_out: 0,
            compactions: Vec::new(),
            started_at: now,
            modified_at: now,
        }
    }

    pub fn record_turn(&mut self, response: &SendResponse) {
        self.turns += 1;
        self.tool_calls += response.tool_calls as u64;
        self.tokens_in += response.tokens_in;
        self.tokens_out += response.tokens_out;
        self.modified_at = Utc::now();
    }

    pub fn record_compaction(&mut self, event: CompactionEvent) {
        self.compactions.push(event);
        self.modified_at = Utc::now();
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let target = dir.join(METRICS_FILE);
        let temp = target.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&temp, &target)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<SessionMetrics> {
        let text = std::fs::read_to_string(dir.join(METRICS_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling-window estimate of token consumption.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl RateEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, tokens: u64) {
        self.record_at(Instant::now(), tokens);
    }

    fn record_at(&mut self, at: Instant, tokens: u64) {
        self.samples.push_back((at, tokens));
        self.evict(at);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Tokens per minute over the rolling window.
    pub fn tokens_per_minute(&self) -> f64 {
        let now = Instant::now();
        let total: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= self.window)
            .map(|(_, n)| n)
            .sum();
        if total == 0 {
            return 0.0;
        }
        let span = match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some(_)) => now.duration_since(*first).max(Duration::from_secs(1)),
            _ => return 0.0,
        };
        total as f64 / (span.as_secs_f64() / 60.0)
    }

    /// Estimated minutes until the window fills at the current rate.
    pub fn minutes_to_limit(&self, used: u64, max: u64) -> Option<f64> {
        let rate = self.tokens_per_minute();
        if rate <= 0.0 || max <= used {
            return None;
        }
        Some((max - used) as f64 / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, ContextUsage};
    use tempfile::TempDir;

    #[test]
    fn test_metrics_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut m = SessionMetrics::new();
        m.record_turn(&SendResponse {
            text: "done".into(),
            events: vec![AdapterEvent::TurnCompleted],
            usage: ContextUsage { used: 10, max: 100 },
            tokens_in: 5,
            tokens_out: 7,
            tool_calls: 2,
        });
        m.record_compaction(CompactionEvent {
            before: 90,
            after: 40,
            preserved: vec!["prompts".into(), "errors".into()],
            timestamp: Utc::now(),
        });
        m.save(dir.path()).unwrap();
        let loaded = SessionMetrics::load(dir.path()).unwrap();
        assert_eq!(loaded.turns, 1);
        assert_eq!(loaded.tool_calls, 2);
        assert_eq!(loaded.tokens_in, 5);
        assert_eq!(loaded.compactions.len(), 1);
    }

    #[test]
    fn test_effectiveness() {
        let good = CompactionEvent {
            before: 100,
            after: 40,
            preserved: vec![],
            timestamp: Utc::now(),
        };
        assert!((good.effectiveness() - 0.4).abs() < f64::EPSILON);
        let useless = CompactionEvent {
            before: 100,
            after: 120,
            preserved: vec![],
            timestamp: Utc::now(),
        };
        assert!(useless.effectiveness() >= 1.0);
    }

    #[test]
    fn test_rate_estimator_window_eviction() {
        let mut rate = RateEstimator::new(Duration::from_secs(300));
        let now = Instant::now();
        rate.record_at(now - Duration::from_secs(600), 1_000_000);
        rate.record_at(now, 100);
        // The stale sample is evicted; only the fresh one counts.
        assert_eq!(rate.samples.len(), 1);
    }

    #[test]
    fn test_minutes_to_limit_none_without_rate() {
        let rate = RateEstimator::default();
        assert_eq!(rate.minutes_to_limit(10, 100), None);
    }

    #[test]
    fn test_minutes_to_limit_none_when_full() {
        let mut rate = RateEstimator::default();
        rate.record(500);
        assert_eq!(rate.minutes_to_limit(100, 100), None);
    }
}
