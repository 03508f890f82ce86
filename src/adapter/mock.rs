//! In-memory mock adapter.
//!
//! The reference backend for tests and dry runs: sessions persist for the
//! process lifetime, responses are scripted, token usage grows by a fixed
//! amount per send, and rate limits and compaction are simulated. The
//! workflow directive `ADAPTER mock` selects it.

use super::{
    Adapter, AdapterCapabilities, AdapterSession, AdapterSessionConfig, AdapterStatus, AuthStatus,
    CompactionResult, ContextUsage, EventSink, ModelInfo, SendResponse, SessionInfo,
};
use crate::adapter::models::fallback_registry;
use crate::adapter::AdapterEvent;
use crate::error::{Error, Result};
use crate::workflow::PreserveCategory;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Mutex;

/// Knobs controlling the simulated backend.
#[derive(Clone)]
pub struct MockBehavior {
    /// Scripted responses, indexed per session send; the default response
    /// covers anything past the script.
    pub responses: Vec<String>,
    pub default_response: String,
    pub tokens_per_send: u64,
    pub max_tokens: u64,
    /// 1-based per-session send ordinal that reports a rate limit.
    pub rate_limit_on_send: Option<u32>,
    /// used-after = used-before × ratio on compaction.
    pub compaction_ratio: f64,
    pub tool_calls_per_turn: u32,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            default_response: "Acknowledged. Proceeding with the requested work.".into(),
            tokens_per_send: 150,
            max_tokens: 100_000,
            rate_limit_on_send: None,
            compaction_ratio: 0.5,
            tool_calls_per_turn: 1,
        }
    }
}

struct MockSessionState {
    usage: ContextUsage,
    sends: u32,
    sink: Option<EventSink>,
    sink_registrations: u32,
    info: SessionInfo,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, MockSessionState>,
    prompts: Vec<(String, String)>,
    counter: u64,
    started: bool,
}

pub struct MockAdapter {
    behavior: MockBehavior,
    inner: Mutex<Inner>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::with_behavior(MockBehavior::default())
    }
}

impl MockAdapter {
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Every prompt sent, in order, across all sessions.
    pub fn sent_prompts(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("mock adapter lock")
            .prompts
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.inner.lock().expect("mock adapter lock").prompts.len()
    }

    /// How many times an event sink was registered for a session.
    pub fn sink_registrations(&self, id: &str) -> u32 {
        self.inner
            .lock()
            .expect("mock adapter lock")
            .sessions
            .get(id)
            .map(|s| s.sink_registrations)
            .unwrap_or(0)
    }

    /// Force a session's used-token count, for threshold tests.
    pub fn set_used_tokens(&self, id: &str, used: u64) {
        if let Some(state) = self
            .inner
            .lock()
            .expect("mock adapter lock")
            .sessions
            .get_mut(id)
        {
            state.usage.used = used;
        }
    }

    fn approx_tokens(text: &str) -> u64 {
        (text.len() as u64 / 4).max(1)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            session_persistence: true,
            compaction: true,
            background_compaction: true,
            cancellation: false,
            model_selection: true,
        }
    }

    async fn start(&self) -> Result<()> {
        self.inner.lock().expect("mock adapter lock").started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.lock().expect("mock adapter lock").started = false;
        Ok(())
    }

    async fn create_session(&self, config: &AdapterSessionConfig) -> Result<AdapterSession> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        inner.counter += 1;
        let id = match &config.session_name {
            Some(name) => format!("mock-{name}"),
            None => format!("mock-{:04}", inner.counter),
        };
        let now = Utc::now();
        inner.sessions.insert(
            id.clone(),
            MockSessionState {
                usage: ContextUsage {
                    used: 0,
                    max: self.behavior.max_tokens,
                },
                sends: 0,
                sink: None,
                sink_registrations: 0,
                info: SessionInfo {
                    id: id.clone(),
                    start_time: now,
                    modified_time: now,
                    summary: None,
                    is_remote: false,
                },
            },
        );
        Ok(AdapterSession::new(id))
    }

    async fn resume_session(
        &self,
        id: &str,
        _config: &AdapterSessionConfig,
    ) -> Result<AdapterSession> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        if !inner.sessions.contains_key(id) {
            // The simulated backend is durable: any id it minted can be
            // reopened, even from a fresh process. Foreign ids stay
            // unknown.
            if !id.starts_with("mock-") {
                return Err(Error::UnknownSession(id.to_string()));
            }
            let now = Utc::now();
            inner.sessions.insert(
                id.to_string(),
                MockSessionState {
                    usage: ContextUsage {
                        used: 0,
                        max: self.behavior.max_tokens,
                    },
                    sends: 0,
                    sink: None,
                    sink_registrations: 0,
                    info: SessionInfo {
                        id: id.to_string(),
                        start_time: now,
                        modified_time: now,
                        summary: None,
                        is_remote: false,
                    },
                },
            );
        }
        Ok(AdapterSession::new(id))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let inner = self.inner.lock().expect("mock adapter lock");
        let mut sessions: Vec<SessionInfo> =
            inner.sessions.values().map(|s| s.info.clone()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        inner
            .sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    fn register_event_sink(&self, session: &AdapterSession, sink: EventSink) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        let state = inner
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| Error::UnknownSession(session.id.clone()))?;
        state.sink = Some(sink);
        state.sink_registrations += 1;
        Ok(())
    }

    async fn send(&self, session: &mut AdapterSession, prompt: &str) -> Result<SendResponse> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        let session_id = session.id.clone();
        inner.prompts.push((session_id.clone(), prompt.to_string()));
        let behavior = self.behavior.clone();
        let state = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.clone()))?;

        state.sends += 1;
        if behavior.rate_limit_on_send == Some(state.sends) {
            return Err(Error::RateLimited(format!(
                "simulated rate limit on send {}",
                state.sends
            )));
        }

        let text = behavior
            .responses
            .get(state.sends as usize - 1)
            .cloned()
            .unwrap_or(behavior.default_response);

        let tokens_in = Self::approx_tokens(prompt);
        let tokens_out = Self::approx_tokens(&text);
        state.usage.used =
            (state.usage.used + behavior.tokens_per_send).min(state.usage.max);
        state.info.modified_time = Utc::now();

        let mut events = Vec::new();
        for i in 0..behavior.tool_calls_per_turn {
            events.push(AdapterEvent::ToolCall {
                name: "bash".into(),
                summary: format!("tool call {i}"),
            });
        }
        events.push(AdapterEvent::UsageUpdate {
            used: state.usage.used,
            max: state.usage.max,
        });
        events.push(AdapterEvent::TurnCompleted);

        if let Some(sink) = &state.sink {
            for event in &events {
                sink(event);
            }
        }

        Ok(SendResponse {
            text,
            events,
            usage: state.usage,
            tokens_in,
            tokens_out,
            tool_calls: behavior.tool_calls_per_turn,
        })
    }

    async fn context_usage(&self, session: &AdapterSession) -> Result<ContextUsage> {
        let inner = self.inner.lock().expect("mock adapter lock");
        inner
            .sessions
            .get(&session.id)
            .map(|s| s.usage)
            .ok_or_else(|| Error::UnknownSession(session.id.clone()))
    }

    async fn compact(
        &self,
        session: &mut AdapterSession,
        preserve: &BTreeSet<PreserveCategory>,
    ) -> Result<CompactionResult> {
        let mut inner = self.inner.lock().expect("mock adapter lock");
        let ratio = self.behavior.compaction_ratio;
        let state = inner
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| Error::UnknownSession(session.id.clone()))?;
        let before = state.usage.used;
        let after = (before as f64 * ratio) as u64;
        state.usage.used = after;
        Ok(CompactionResult {
            tokens_before: before,
            tokens_after: after,
            preserved_items: preserve.len() as u32 * 4,
        })
    }

    async fn status(&self) -> Result<AdapterStatus> {
        Ok(AdapterStatus {
            name: "mock".into(),
            available: true,
            version: Some("builtin".into()),
        })
    }

    async fn auth_status(&self) -> Result<AuthStatus> {
        Ok(AuthStatus {
            authenticated: true,
            account: Some("mock@localhost".into()),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(fallback_registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config() -> AdapterSessionConfig {
        AdapterSessionConfig::default()
    }

    #[tokio::test]
    async fn test_create_and_resume() {
        let adapter = MockAdapter::default();
        let session = adapter.create_session(&config()).await.unwrap();
        assert!(session.id.starts_with("mock-"));
        let resumed = adapter.resume_session(&session.id, &config()).await.unwrap();
        assert_eq!(resumed.id, session.id);
        // Ids this backend never minted are unknown; its own id shape is
        // durable and always reopenable.
        assert!(matches!(
            adapter.resume_session("sess-foreign", &config()).await,
            Err(Error::UnknownSession(_))
        ));
        assert!(adapter.resume_session("mock-s9", &config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_grows_usage_and_records_prompts() {
        let adapter = MockAdapter::default();
        let mut session = adapter.create_session(&config()).await.unwrap();
        let first = adapter.send(&mut session, "Say \"hello\".").await.unwrap();
        assert_eq!(first.usage.used, 150);
        let second = adapter.send(&mut session, "again").await.unwrap();
        assert_eq!(second.usage.used, 300);
        assert_eq!(adapter.sent_prompts(), vec!["Say \"hello\".", "again"]);
    }

    #[tokio::test]
    async fn test_scripted_responses() {
        let adapter = MockAdapter::with_behavior(MockBehavior {
            responses: vec!["first".into(), "second".into()],
            ..MockBehavior::default()
        });
        let mut session = adapter.create_session(&config()).await.unwrap();
        assert_eq!(adapter.send(&mut session, "a").await.unwrap().text, "first");
        assert_eq!(adapter.send(&mut session, "b").await.unwrap().text, "second");
        // Script exhausted: default response takes over.
        assert!(adapter
            .send(&mut session, "c")
            .await
            .unwrap()
            .text
            .contains("Acknowledged"));
    }

    #[tokio::test]
    async fn test_rate_limit_simulation() {
        let adapter = MockAdapter::with_behavior(MockBehavior {
            rate_limit_on_send: Some(2),
            ..MockBehavior::default()
        });
        let mut session = adapter.create_session(&config()).await.unwrap();
        adapter.send(&mut session, "one").await.unwrap();
        assert!(matches!(
            adapter.send(&mut session, "two").await,
            Err(Error::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_compaction_halves_usage() {
        let adapter = MockAdapter::default();
        let mut session = adapter.create_session(&config()).await.unwrap();
        adapter.set_used_tokens(&session.id, 80_000);
        let result = adapter
            .compact(&mut session, &PreserveCategory::default_set())
            .await
            .unwrap();
        assert_eq!(result.tokens_before, 80_000);
        assert_eq!(result.tokens_after, 40_000);
        let usage = adapter.context_usage(&session).await.unwrap();
        assert_eq!(usage.used, 40_000);
    }

    #[tokio::test]
    async fn test_event_sink_fires_once_per_send() {
        let adapter = MockAdapter::default();
        let mut session = adapter.create_session(&config()).await.unwrap();
        let turns = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&turns);
        assert!(session.mark_handler_registered());
        adapter
            .register_event_sink(
                &session,
                Box::new(move |event| {
                    if matches!(event, AdapterEvent::TurnCompleted) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        for _ in 0..3 {
            adapter.send(&mut session, "go").await.unwrap();
        }
        assert_eq!(turns.load(Ordering::SeqCst), 3);
        assert_eq!(adapter.sink_registrations(&session.id), 1);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let adapter = MockAdapter::default();
        let session = adapter.create_session(&config()).await.unwrap();
        adapter.delete_session(&session.id).await.unwrap();
        assert!(matches!(
            adapter.delete_session(&session.id).await,
            Err(Error::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_named_session_id() {
        let adapter = MockAdapter::default();
        let session = adapter
            .create_session(&AdapterSessionConfig {
                session_name: Some("s4".into()),
                ..AdapterSessionConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(session.id, "mock-s4");
    }
}
