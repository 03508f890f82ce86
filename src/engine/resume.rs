//! Resuming suspended sessions.
//!
//! Resume reads the checkpoint, rebuilds the workflow from the session's
//! snapshot, reopens the adapter conversation by durable id, and continues
//! from the step after the one that suspended. The checkpoint status
//! returns to `running` before the next send. A consult resume injects a
//! synthetic topic reminder ahead of the next authored prompt.

use super::{Engine, EngineOptions, RunReport, WORKFLOW_SNAPSHOT_FILE};
use crate::adapter::{create_adapter, Adapter, AdapterSessionConfig};
use crate::context::Resolver;
use crate::error::{Error, Result};
use crate::plugin::PluginRegistry;
use crate::render::RenderedDocument;
use crate::session::{
    Checkpoint, CheckpointStatus, LoopGuard, Session, SessionMetrics, SessionStore,
};
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::verify::VerifierRegistry;
use crate::workflow::{Step, Workflow};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::info;

/// Resume a session by id using the adapter named in its workflow.
pub async fn resume_session(
    session_id: &str,
    options: EngineOptions,
    answer: Option<String>,
) -> Result<RunReport> {
    let store = match &options.store {
        Some(store) => store.clone(),
        None => SessionStore::from_env()?,
    };
    let (workflow, checkpoint) = load_resume_state(&store, session_id)?;
    let config = super::EffectiveConfig::resolve(&workflow, &options);
    let adapter = create_adapter(&config.adapter_name)?;
    resume_with_adapter(workflow, adapter, options, checkpoint, answer).await
}

/// Load the checkpoint and workflow snapshot for a stored session.
pub fn load_resume_state(store: &SessionStore, session_id: &str) -> Result<(Workflow, Checkpoint)> {
    let stored = store.load_existing(session_id)?;
    let checkpoint = stored
        .checkpoint
        .ok_or_else(|| Error::Session(format!("session {session_id} has no checkpoint")))?;
    let snapshot = store.session_dir(session_id).join(WORKFLOW_SNAPSHOT_FILE);
    let text = std::fs::read_to_string(&snapshot).map_err(|_| {
        Error::Session(format!(
            "session {session_id} has no workflow snapshot at {}",
            snapshot.display()
        ))
    })?;
    let workflow = RenderedDocument::from_json(&text)?.workflow;
    if workflow.hash != checkpoint.workflow_hash {
        return Err(Error::Session(format!(
            "workflow hash mismatch: checkpoint has {}, snapshot has {}",
            checkpoint.workflow_hash, workflow.hash
        )));
    }
    Ok((workflow, checkpoint))
}

/// Consult staleness guard: a consulting checkpoint older than the step's
/// timeout (or the header default) fails instead of resuming.
fn check_consult_expiry(workflow: &Workflow, checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.status != CheckpointStatus::Consulting {
        return Ok(());
    }
    let timeout = match workflow.steps.get(checkpoint.step_index) {
        Some(Step::Consult(consult)) => consult.timeout.or(workflow.header.consult_timeout),
        _ => workflow.header.consult_timeout,
    };
    if let Some(timeout) = timeout {
        let age = checkpoint.age().to_std().unwrap_or_default();
        if age > timeout {
            return Err(Error::ConsultExpired { timeout });
        }
    }
    Ok(())
}

/// Resume against an explicit adapter instance (tests inject the mock).
pub async fn resume_with_adapter(
    workflow: Workflow,
    adapter: Arc<dyn Adapter>,
    mut options: EngineOptions,
    checkpoint: Checkpoint,
    answer: Option<String>,
) -> Result<RunReport> {
    check_consult_expiry(&workflow, &checkpoint)?;

    let config = super::EffectiveConfig::resolve(&workflow, &options);
    let store = match options.store.take() {
        Some(store) => store,
        None => SessionStore::from_env()?,
    };
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let plugins = PluginRegistry::load(&config.workspace, Arc::clone(&runner))?;
    let resolver = Resolver::new(&config.workspace).with_aliases(options.aliases.clone());

    adapter.start().await?;
    let session_config = AdapterSessionConfig {
        model: None,
        session_name: config.session_name.clone(),
        mode: config.mode,
        infinite: config.infinite_sessions,
    };
    let adapter_session = adapter
        .resume_session(&checkpoint.session_id, &session_config)
        .await?;

    let session_dir = store.session_dir(&checkpoint.session_id);
    let mut session = Session::new(checkpoint.session_id.clone(), session_dir.clone());
    session.name = config.session_name.clone();
    session.cycle = checkpoint.cycle;
    session.step_index = checkpoint.step_index;
    if let Ok(metrics) = SessionMetrics::load(&session_dir) {
        session.metrics = metrics;
    }

    let mut vars = options.vars.clone();
    if let Some(answer) = &answer {
        vars.set_cli("CONSULT_ANSWER", answer.clone());
    }

    let mut engine = Engine {
        prologue_files: options.prologues.clone(),
        base_vars: vars,
        last_prompt_index: workflow
            .steps
            .iter()
            .rposition(|s| matches!(s, Step::Prompt(_))),
        workflow,
        config,
        adapter,
        runner,
        verifiers: VerifierRegistry::builtin(),
        plugins,
        resolver,
        store,
        session,
        adapter_session,
        guard: LoopGuard::default(),
        buffer: super::PromptBuffer::default(),
        asyncs: super::AsyncRegistry::default(),
        warnings: Vec::new(),
        trace: Vec::new(),
        cycle_trace: Vec::new(),
        cancel: super::CancellationHandle::default(),
        turns_observed: Arc::new(AtomicU64::new(0)),
    };
    engine.register_event_sink()?;

    if checkpoint.status == CheckpointStatus::Consulting {
        let topic = checkpoint
            .consultation_topic
            .clone()
            .unwrap_or_else(|| "unspecified".to_string());
        let mut synthetic =
            format!("Consultation resumed on topic: {topic}. Open questions follow.");
        if let Some(answer) = &answer {
            synthetic.push_str(&format!("\n\nConsultation answer: {answer}"));
        }
        engine.buffer.push_prologue(&synthetic);
    }

    info!(
        "resuming session {} at cycle {}, step {}",
        checkpoint.session_id,
        checkpoint.cycle,
        checkpoint.step_index + 1
    );
    // The suspended step itself is complete; pick up after it. The status
    // goes back to running before any send.
    engine.save_checkpoint(CheckpointStatus::Running, None, None)?;
    engine
        .run_from(checkpoint.cycle, checkpoint.step_index + 1)
        .await
}
