//! Productivity heuristics that abort runaway sessions.
//!
//! After each send the guard inspects the turn: a turn with no tool calls
//! and a sub-threshold response is "productivity empty", and three in a row
//! abort the session. The guard also keeps the last few assistant responses
//! for diagnostics.

use crate::adapter::SendResponse;
use crate::error::{Error, Result};
use std::collections::VecDeque;

pub const DEFAULT_MIN_RESPONSE_LENGTH: usize = 16;
pub const DEFAULT_RECENT_RESPONSES: usize = 3;
const EMPTY_STREAK_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct LoopGuard {
    min_response_length: usize,
    recent: VecDeque<String>,
    recent_capacity: usize,
    empty_streak: u32,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RESPONSE_LENGTH, DEFAULT_RECENT_RESPONSES)
    }
}

impl LoopGuard {
    pub fn new(min_response_length: usize, recent_capacity: usize) -> Self {
        Self {
            min_response_length,
            recent: VecDeque::with_capacity(recent_capacity),
            recent_capacity,
            empty_streak: 0,
        }
    }

    /// Inspect a completed turn. Errors with `LoopDetected` on the third
    /// consecutive productivity-empty turn.
    pub fn observe(&mut self, response: &SendResponse) -> Result<()> {
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(response.text.clone());

        let empty = response.tool_calls == 0 && response.text.len() < self.min_response_length;
        if empty {
            self.empty_streak += 1;
        } else {
            self.empty_streak = 0;
        }
        if self.empty_streak >= EMPTY_STREAK_LIMIT {
            return Err(Error::LoopDetected(format!(
                "{EMPTY_STREAK_LIMIT} consecutive turns with no tool calls and responses under {} chars",
                self.min_response_length
            )));
        }
        Ok(())
    }

    pub fn recent_responses(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ContextUsage;

    fn turn(text: &str, tool_calls: u32) -> SendResponse {
        SendResponse {
            text: text.into(),
            events: vec![],
            usage: ContextUsage { used: 0, max: 100 },
            tokens_in: 1,
            tokens_out: 1,
            tool_calls,
        }
    }

    #[test]
    fn test_three_empty_turns_abort() {
        let mut guard = LoopGuard::default();
        guard.observe(&turn("ok", 0)).unwrap();
        guard.observe(&turn("ok", 0)).unwrap();
        let err = guard.observe(&turn("ok", 0)).unwrap_err();
        assert!(matches!(err, Error::LoopDetected(_)));
    }

    #[test]
    fn test_tool_calls_reset_streak() {
        let mut guard = LoopGuard::default();
        guard.observe(&turn("ok", 0)).unwrap();
        guard.observe(&turn("ok", 1)).unwrap();
        guard.observe(&turn("ok", 0)).unwrap();
        guard.observe(&turn("ok", 0)).unwrap();
        // Streak is 2 after the reset; still fine.
    }

    #[test]
    fn test_long_response_resets_streak() {
        let mut guard = LoopGuard::default();
        guard.observe(&turn("ok", 0)).unwrap();
        guard
            .observe(&turn("a response comfortably over the threshold", 0))
            .unwrap();
        guard.observe(&turn("ok", 0)).unwrap();
        guard.observe(&turn("ok", 0)).unwrap();
    }

    #[test]
    fn test_recent_responses_bounded() {
        let mut guard = LoopGuard::default();
        for i in 0..5 {
            let _ = guard.observe(&turn(&format!("response number {i} with enough text"), 1));
        }
        let recent: Vec<_> = guard.recent_responses().collect();
        assert_eq!(recent.len(), DEFAULT_RECENT_RESPONSES);
        assert!(recent[2].contains("number 4"));
    }
}
