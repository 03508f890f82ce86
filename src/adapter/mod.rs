//! Adapter contract abstracting an assistant backend.
//!
//! Concrete adapters implement [`Adapter`]; the engine talks only to the
//! trait. Capabilities are declared, not discovered: an unsupported
//! operation fails with a typed `NotSupported` error the engine can
//! translate for the user. Event sinks are registered exactly once per
//! session, guarded by an idempotency flag, so N sends produce N event
//! batches rather than N×K.

pub mod mock;
pub mod models;

pub use mock::{MockAdapter, MockBehavior};
pub use models::{ModelCatalog, ModelInfo};

use crate::error::{Error, Result};
use crate::workflow::{Mode, ModelSpec, PreserveCategory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Operations an adapter declares support for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub session_persistence: bool,
    pub compaction: bool,
    pub background_compaction: bool,
    pub cancellation: bool,
    pub model_selection: bool,
}

/// Adapter-reported context window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub used: u64,
    pub max: u64,
}

impl ContextUsage {
    pub fn percent(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.used as f64 / self.max as f64) * 100.0
    }
}

/// Structured records multiplexed from the backend event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AdapterEvent {
    ToolCall { name: String, summary: String },
    Delta { text: String },
    UsageUpdate { used: u64, max: u64 },
    TurnCompleted,
}

/// The assistant's reply to one send, with final token accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub text: String,
    pub events: Vec<AdapterEvent>,
    /// Final usage for the session; the engine overwrites its own counters
    /// with this after every send.
    pub usage: ContextUsage,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u32,
}

/// Outcome of a compaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionResult {
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub preserved_items: u32,
}

/// A backend conversation listed by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub is_remote: bool,
}

/// Backend availability metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub name: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

/// Configuration for creating or resuming a backend conversation.
#[derive(Debug, Clone, Default)]
pub struct AdapterSessionConfig {
    pub model: Option<String>,
    pub session_name: Option<String>,
    pub mode: Mode,
    pub infinite: bool,
}

/// Callback receiving each structured event batch.
pub type EventSink = Box<dyn Fn(&AdapterEvent) + Send + Sync>;

/// Opaque per-conversation handle held by the engine.
///
/// The durable `id` is minted by the adapter at creation and is the only
/// cross-process identity; everything else is engine-side bookkeeping.
pub struct AdapterSession {
    pub id: String,
    handler_registered: bool,
}

impl AdapterSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler_registered: false,
        }
    }

    /// One-shot registration guard; returns false if already registered.
    pub fn mark_handler_registered(&mut self) -> bool {
        if self.handler_registered {
            return false;
        }
        self.handler_registered = true;
        true
    }

    pub fn handler_registered(&self) -> bool {
        self.handler_registered
    }
}

impl std::fmt::Debug for AdapterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSession")
            .field("id", &self.id)
            .field("handler_registered", &self.handler_registered)
            .finish()
    }
}

/// The contract every assistant backend implements.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Lifecycle; both idempotent.
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    async fn create_session(&self, config: &AdapterSessionConfig) -> Result<AdapterSession>;

    /// Reopen by durable id; `UnknownSession` if absent.
    async fn resume_session(&self, id: &str, config: &AdapterSessionConfig)
        -> Result<AdapterSession>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Register the event sink for a session. Callers must go through
    /// [`AdapterSession::mark_handler_registered`] so registration happens
    /// exactly once per session.
    fn register_event_sink(&self, session: &AdapterSession, sink: EventSink) -> Result<()>;

    /// Blocking send; returns the textual response plus the event batch and
    /// final token counts.
    async fn send(&self, session: &mut AdapterSession, prompt: &str) -> Result<SendResponse>;

    async fn context_usage(&self, session: &AdapterSession) -> Result<ContextUsage>;

    async fn compact(
        &self,
        session: &mut AdapterSession,
        preserve: &BTreeSet<PreserveCategory>,
    ) -> Result<CompactionResult>;

    async fn status(&self) -> Result<AdapterStatus>;

    async fn auth_status(&self) -> Result<AuthStatus>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Choose an available model satisfying the workflow's constraint bag.
    async fn select_model(&self, spec: &ModelSpec) -> Result<String> {
        let models = self.list_models().await?;
        ModelCatalog::new(models).select(spec)
    }
}

/// Construct an adapter by name. The mock adapter is always available;
/// anything else must come from operator configuration.
pub fn create_adapter(name: &str) -> Result<Arc<dyn Adapter>> {
    match name {
        "mock" => Ok(Arc::new(MockAdapter::default())),
        other => Err(Error::AdapterUnavailable(format!(
            "unknown adapter {other:?} (available: mock)"
        ))),
    }
}

/// Typed conversion for unsupported operations.
pub fn not_supported(adapter: &str, operation: &str) -> Error {
    match operation {
        "resume_session" | "list_sessions" => {
            Error::SessionPersistenceUnsupported(adapter.to_string())
        }
        _ => Error::NotSupported {
            adapter: adapter.to_string(),
            operation: operation.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent() {
        let usage = ContextUsage { used: 85, max: 100 };
        assert!((usage.percent() - 85.0).abs() < f64::EPSILON);
        assert_eq!(ContextUsage { used: 5, max: 0 }.percent(), 0.0);
    }

    #[test]
    fn test_handler_registration_is_one_shot() {
        let mut session = AdapterSession::new("mock-1");
        assert!(session.mark_handler_registered());
        assert!(!session.mark_handler_registered());
        assert!(session.handler_registered());
    }

    #[test]
    fn test_create_adapter() {
        assert!(create_adapter("mock").is_ok());
        assert!(matches!(
            create_adapter("gpt-9"),
            Err(Error::AdapterUnavailable(_))
        ));
    }

    #[test]
    fn test_not_supported_conversion() {
        assert!(matches!(
            not_supported("mock", "resume_session"),
            Error::SessionPersistenceUnsupported(_)
        ));
        assert!(matches!(
            not_supported("mock", "compact"),
            Error::NotSupported { .. }
        ));
    }
}
