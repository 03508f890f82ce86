//! Iteration engine.
//!
//! The outer loop walks the workflow's step list once per cycle, dispatches
//! each step to its executor, and enforces the session policies: cycle
//! limits, compaction thresholds, loop detection, stop-file and
//! cancellation checks at step boundaries, and checkpointing on every
//! abnormal exit. Retries, compactions and branch blocks never consume a
//! cycle.

pub mod async_procs;
pub mod prompt_buffer;
pub mod resume;
mod steps;

pub use async_procs::AsyncRegistry;
pub use prompt_buffer::PromptBuffer;

use crate::adapter::{
    create_adapter, Adapter, AdapterEvent, AdapterSession, AdapterSessionConfig,
};
use crate::context::Resolver;
use crate::error::{Error, Result};
use crate::plugin::PluginRegistry;
use crate::render::{RenderedCycle, RenderedDocument, RenderedStep};
use crate::session::{
    Checkpoint, CheckpointStatus, LoopGuard, Session, SessionPhase, SessionStore,
};
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::template::Variables;
use crate::verify::VerifierRegistry;
use crate::workflow::{
    CompactionThresholds, CycleLimit, Mode, Step, ValidationMode, Workflow,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const WORKFLOW_SNAPSHOT_FILE: &str = "workflow.json";

/// CLI-level overrides; anything unset falls back to the workflow header,
/// then to defaults.
#[derive(Default)]
pub struct EngineOptions {
    pub workspace: Option<PathBuf>,
    pub max_cycles: Option<CycleLimit>,
    pub session_name: Option<String>,
    pub adapter: Option<String>,
    pub model: Option<String>,
    /// Operator-config fallback model, weaker than the workflow header.
    pub default_model: Option<String>,
    pub mode: Option<Mode>,
    pub validation: Option<ValidationMode>,
    pub compaction_min: Option<u8>,
    pub compaction_threshold: Option<u8>,
    pub compaction_max: Option<u8>,
    pub infinite_sessions: Option<bool>,
    pub allow_shell: bool,
    /// Extra prologue files injected at each cycle start.
    pub prologues: Vec<PathBuf>,
    pub vars: Variables,
    /// Named workspace roots from operator config, for `alias:` references.
    pub aliases: std::collections::HashMap<String, PathBuf>,
    /// Session store override, mainly for tests.
    pub store: Option<SessionStore>,
}

/// The fully resolved run configuration. Priority: CLI flag > workflow
/// directive > defaults.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub workspace: PathBuf,
    pub adapter_name: String,
    pub max_cycles: CycleLimit,
    pub mode: Mode,
    pub validation: ValidationMode,
    pub compaction: CompactionThresholds,
    pub infinite_sessions: bool,
    pub allow_shell: bool,
    pub session_name: Option<String>,
}

impl EffectiveConfig {
    pub fn resolve(workflow: &Workflow, options: &EngineOptions) -> Self {
        let header = &workflow.header;
        let mut compaction = header.compaction;
        if let Some(min) = options.compaction_min {
            compaction.min = min;
        }
        if let Some(background) = options.compaction_threshold {
            compaction.background = background;
        }
        if let Some(max) = options.compaction_max {
            compaction.max = max;
        }
        Self {
            workspace: options
                .workspace
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            adapter_name: options
                .adapter
                .clone()
                .or_else(|| header.adapter.clone())
                .unwrap_or_else(|| "mock".to_string()),
            max_cycles: options.max_cycles.unwrap_or(header.max_cycles),
            mode: options.mode.unwrap_or(header.mode),
            validation: options.validation.unwrap_or(header.validation_mode),
            compaction,
            infinite_sessions: options
                .infinite_sessions
                .unwrap_or(header.infinite_sessions),
            allow_shell: options.allow_shell || header.allow_shell,
            session_name: options
                .session_name
                .clone()
                .or_else(|| header.session_name.clone()),
        }
    }
}

/// Cooperative cancellation shared with signal handlers; idempotent.
#[derive(Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a completed (or suspended) run looked like.
#[derive(Debug)]
pub struct RunReport {
    pub session_id: String,
    pub cycles_completed: u32,
    pub trace: Vec<RenderedCycle>,
    pub warnings: Vec<String>,
}

pub struct Engine {
    pub(crate) workflow: Workflow,
    pub(crate) config: EffectiveConfig,
    pub(crate) base_vars: Variables,
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) verifiers: VerifierRegistry,
    pub(crate) plugins: PluginRegistry,
    pub(crate) resolver: Resolver,
    pub(crate) store: SessionStore,
    pub(crate) session: Session,
    pub(crate) adapter_session: AdapterSession,
    pub(crate) guard: LoopGuard,
    pub(crate) buffer: PromptBuffer,
    pub(crate) asyncs: AsyncRegistry,
    pub(crate) warnings: Vec<String>,
    pub(crate) trace: Vec<RenderedCycle>,
    pub(crate) cycle_trace: Vec<RenderedStep>,
    pub(crate) prologue_files: Vec<PathBuf>,
    pub(crate) cancel: CancellationHandle,
    pub(crate) turns_observed: Arc<AtomicU64>,
    /// Index of the last authored prompt, for epilogue attachment.
    pub(crate) last_prompt_index: Option<usize>,
}

impl Engine {
    /// Build an engine with the adapter named by the effective config.
    pub async fn new(workflow: Workflow, options: EngineOptions) -> Result<Self> {
        let config = EffectiveConfig::resolve(&workflow, &options);
        let adapter = create_adapter(&config.adapter_name)?;
        Self::with_adapter(workflow, adapter, options).await
    }

    /// Build an engine around an explicit adapter instance. Tests inject a
    /// scripted mock here.
    pub async fn with_adapter(
        workflow: Workflow,
        adapter: Arc<dyn Adapter>,
        mut options: EngineOptions,
    ) -> Result<Self> {
        let config = EffectiveConfig::resolve(&workflow, &options);
        let store = match options.store.take() {
            Some(store) => store,
            None => SessionStore::from_env()?,
        };
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
        let plugins = PluginRegistry::load(&config.workspace, Arc::clone(&runner))?;
        let resolver = Resolver::new(&config.workspace).with_aliases(options.aliases.clone());

        Self::validate_custom_steps(&workflow, &plugins, config.validation)?;

        adapter.start().await?;
        let model = Self::pick_model(&workflow, &options, adapter.as_ref()).await?;
        let session_config = AdapterSessionConfig {
            model,
            session_name: config.session_name.clone(),
            mode: config.mode,
            infinite: config.infinite_sessions,
        };
        let adapter_session = adapter.create_session(&session_config).await?;
        let session_dir = store.create_session_dir(&adapter_session.id)?;
        let mut session = Session::new(adapter_session.id.clone(), session_dir);
        session.name = config.session_name.clone();

        let mut engine = Self {
            prologue_files: options.prologues.clone(),
            base_vars: options.vars.clone(),
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
            buffer: PromptBuffer::default(),
            asyncs: AsyncRegistry::default(),
            warnings: Vec::new(),
            trace: Vec::new(),
            cycle_trace: Vec::new(),
            cancel: CancellationHandle::default(),
            turns_observed: Arc::new(AtomicU64::new(0)),
        };
        engine.register_event_sink()?;
        engine.snapshot_workflow()?;
        Ok(engine)
    }

    async fn pick_model(
        workflow: &Workflow,
        options: &EngineOptions,
        adapter: &dyn Adapter,
    ) -> Result<Option<String>> {
        if let Some(model) = &options.model {
            return Ok(Some(crate::adapter::models::resolve_alias(model)));
        }
        if let Some(spec) = &workflow.header.model {
            return Ok(Some(adapter.select_model(spec).await?));
        }
        if let Ok(id) = std::env::var(crate::adapter::models::MODEL_DEFAULT_ENV) {
            if !id.is_empty() {
                return Ok(Some(crate::adapter::models::resolve_alias(&id)));
            }
        }
        if let Some(id) = &options.default_model {
            return Ok(Some(crate::adapter::models::resolve_alias(id)));
        }
        Ok(None)
    }

    fn validate_custom_steps(
        workflow: &Workflow,
        plugins: &PluginRegistry,
        validation: ValidationMode,
    ) -> Result<()> {
        for step in &workflow.steps {
            if let Step::Custom(custom) = step {
                if !plugins.knows(&custom.name) {
                    if validation.is_strict() {
                        return Err(Error::Validation(format!(
                            "unknown directive {} and no plugin handler registered",
                            custom.name
                        )));
                    }
                    warn!("unknown directive {} will be skipped", custom.name);
                }
            }
        }
        Ok(())
    }

    /// One-shot event sink registration, guarded by the session flag so a
    /// resumed or long-lived session never stacks handlers.
    fn register_event_sink(&mut self) -> Result<()> {
        if !self.adapter_session.mark_handler_registered() {
            return Ok(());
        }
        let turns = Arc::clone(&self.turns_observed);
        self.adapter.register_event_sink(
            &self.adapter_session,
            Box::new(move |event| {
                if matches!(event, AdapterEvent::TurnCompleted) {
                    turns.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
    }

    /// Persist the parsed workflow next to the session state so `sessions
    /// resume` can rebuild the run without the original file.
    fn snapshot_workflow(&self) -> Result<()> {
        let document = RenderedDocument::plan(&self.workflow)?;
        let path = self.session.dir.join(WORKFLOW_SNAPSHOT_FILE);
        std::fs::write(path, document.to_json()?)?;
        Ok(())
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn turns_observed(&self) -> u64 {
        self.turns_observed.load(Ordering::SeqCst)
    }

    /// Template environment for the current step position.
    pub(crate) fn vars_for_step(&self) -> Variables {
        let mut vars = self.base_vars.clone();
        vars.set_default(
            "WORKFLOW_PATH",
            self.workflow.source_path.display().to_string(),
        );
        vars.set_default("WORKFLOW_HASH", self.workflow.hash.clone());
        vars.set_default("SESSION_ID", self.session.id.clone());
        vars.set_default("CYCLE", self.session.cycle.to_string());
        vars.set_default("STEP_INDEX", self.session.step_index.to_string());
        vars.set_default("TIMESTAMP", chrono::Utc::now().to_rfc3339());
        vars.set_default("STOP_FILE", self.session.stop_file.display().to_string());
        vars
    }

    pub(crate) fn expand(&mut self, text: &str) -> Result<String> {
        let vars = self.vars_for_step();
        let expanded = crate::template::expand(
            text,
            &vars,
            self.config.validation.is_strict(),
            self.session.step_index,
        )?;
        self.warnings.extend(expanded.warnings);
        Ok(expanded.text)
    }

    pub(crate) fn record_step(
        &mut self,
        step: &Step,
        outputs: serde_json::Value,
        branch: Option<crate::render::BranchTaken>,
    ) {
        match RenderedStep::from_step(step) {
            Ok(mut rendered) => {
                rendered.outputs = Some(outputs);
                rendered.branch_taken = branch;
                self.cycle_trace.push(rendered);
            }
            Err(e) => self.warnings.push(format!("trace rendering failed: {e}")),
        }
    }

    /// Run from the beginning: cycle 1, step 0.
    pub async fn run(self) -> Result<RunReport> {
        self.run_from(1, 0).await
    }

    /// Run from a resume position.
    pub async fn run_from(mut self, start_cycle: u32, start_step: usize) -> Result<RunReport> {
        let outcome = self.execute(start_cycle, start_step).await;
        self.teardown(&outcome).await?;
        let report = RunReport {
            session_id: self.session.id.clone(),
            // Every completed cycle pushed its trace entry.
            cycles_completed: self.trace.len() as u32,
            trace: std::mem::take(&mut self.trace),
            warnings: std::mem::take(&mut self.warnings),
        };
        outcome.map(|()| report)
    }

    async fn execute(&mut self, start_cycle: u32, start_step: usize) -> Result<()> {
        if self.session.phase == SessionPhase::Initialized {
            self.session.transition(SessionPhase::Running)?;
        }
        self.save_checkpoint(CheckpointStatus::Running, None, None)?;

        // Required context resolves once, before any adapter contact, and
        // becomes the prelude of the first prompt. Strict mode fails here.
        if start_cycle == 1 && start_step == 0 {
            let resolved = self.resolver.resolve_requirements(
                &self.workflow.required_context,
                &self.workflow.context_excludes,
                self.config.validation.is_strict(),
            )?;
            self.warnings.extend(resolved.warnings.iter().cloned());
            self.buffer.push_context(&resolved.files);
        }

        let mut cycle = start_cycle;
        let mut first_step = start_step;
        while self.config.max_cycles.admits(cycle) {
            self.session.cycle = cycle;
            info!("cycle {cycle} starting for session {}", self.session.id);
            if first_step == 0 {
                // Prologues attach at cycle start; a mid-cycle resume
                // already had its injection.
                self.inject_prologues()?;
            }

            let steps = self.workflow.steps.clone();
            for (index, step) in steps.iter().enumerate().skip(first_step) {
                self.session.step_index = index;
                self.check_boundary()?;
                self.dispatch(step, index).await?;
            }
            first_step = 0;

            if self.buffer.has_pending() {
                let dropped = self.buffer.discard();
                self.warnings.push(format!(
                    "{dropped} pending context block(s) had no following prompt and were discarded"
                ));
            }
            // Advisory productivity signal; nothing automatic depends on it.
            info!(
                "cycle {cycle} completed {} step(s), {} turn(s) so far",
                self.cycle_trace.len(),
                self.session.metrics.turns
            );
            self.trace.push(RenderedCycle {
                cycle,
                steps: std::mem::take(&mut self.cycle_trace),
            });

            if !self.config.max_cycles.admits(cycle + 1) {
                break;
            }
            cycle += 1;
            self.session.next_cycle();
        }

        self.session.transition(SessionPhase::Completed)?;
        Ok(())
    }

    /// Safe-point checks between steps: cancellation, then the stop file.
    fn check_boundary(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("user interrupt".into()));
        }
        if self.session.stop_requested() {
            return Err(Error::StopFileRequested(self.session.stop_file.clone()));
        }
        Ok(())
    }

    fn inject_prologues(&mut self) -> Result<()> {
        if let Some(prologue) = self.workflow.header.decorations.prologue.clone() {
            self.buffer.push_prologue(&prologue);
        }
        for path in self.prologue_files.clone() {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                Error::Validation(format!("cannot read prologue {}: {e}", path.display()))
            })?;
            self.buffer.push_prologue(&text);
        }
        Ok(())
    }

    /// Dispatch one step to its executor. Boxed because branch blocks
    /// re-enter dispatch through the RUN executor.
    fn dispatch<'a>(
        &'a mut self,
        step: &'a Step,
        index: usize,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!(
                "cycle {} step {index}: {}",
                self.session.cycle,
                step.kind()
            );
            match step {
                Step::Prompt(prompt) => self.execute_prompt(step, prompt, index).await,
                Step::Run(run) => self.execute_run(step, run, index).await,
                Step::RunWait { handle } => self.execute_run_wait(step, handle).await,
                Step::Verify(verify) => self.execute_verify(step, verify).await,
                Step::ContextInject { patterns } => self.execute_inject(step, patterns),
                Step::Compact(compact) => self.execute_compact(step, compact).await,
                Step::Checkpoint { name } => self.execute_checkpoint(step, name),
                Step::Pause { message } => self.execute_pause(step, message.clone()),
                Step::Consult(consult) => self.execute_consult(step, consult),
                Step::NewConversation => self.execute_new_conversation(step).await,
                Step::Custom(custom) => self.execute_custom(step, custom).await,
            }
        })
    }

    pub(crate) fn save_checkpoint(
        &self,
        status: CheckpointStatus,
        message: Option<String>,
        topic: Option<String>,
    ) -> Result<()> {
        let mut checkpoint = Checkpoint::new(
            &self.session.id,
            &self.workflow.hash,
            self.session.cycle,
            self.session.step_index,
            status,
        );
        checkpoint.message = message;
        checkpoint.consultation_topic = topic;
        checkpoint.save(&self.session.dir)
    }

    /// Post-run bookkeeping: reap async children, persist metrics, and
    /// either clear or pin the checkpoint depending on how the run ended.
    async fn teardown(&mut self, outcome: &Result<()>) -> Result<()> {
        let reaped = self.asyncs.reap_all();
        if reaped > 0 {
            self.warnings
                .push(format!("{reaped} async run(s) were never waited on"));
        }
        self.session.metrics.save(&self.session.dir)?;

        match outcome {
            Ok(()) => {
                // Normal termination destroys the checkpoint.
                Checkpoint::delete(&self.session.dir)?;
                info!("session {} completed", self.session.id);
            }
            Err(e) if e.is_suspension() => {
                // The suspension already wrote its checkpoint.
            }
            Err(e) => {
                let _ = self.session.transition(SessionPhase::Error);
                self.save_checkpoint(
                    CheckpointStatus::Error,
                    Some(e.to_string()),
                    None,
                )?;
            }
        }
        Ok(())
    }
}

/// Static validation used by the `validate` CLI command: context
/// resolution and custom-directive coverage, without touching an adapter.
pub fn validate_workflow(
    workflow: &Workflow,
    workspace: &std::path::Path,
    strict_override: Option<bool>,
    allow_missing: bool,
    extra_excludes: &[crate::context::RefPattern],
) -> Result<Vec<String>> {
    let strict = strict_override.unwrap_or(workflow.header.validation_mode.is_strict());
    let resolver = Resolver::new(workspace);
    let mut excludes = workflow.context_excludes.clone();
    excludes.extend_from_slice(extra_excludes);
    let resolved = resolver.resolve_requirements(
        &workflow.required_context,
        &excludes,
        strict && !allow_missing,
    )?;
    let mut warnings = resolved.warnings;

    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let plugins = PluginRegistry::load(workspace, runner)?;
    for step in &workflow.steps {
        if let Step::Custom(custom) = step {
            if !plugins.knows(&custom.name) {
                let message = format!("unknown directive {}", custom.name);
                if strict {
                    return Err(Error::Validation(message));
                }
                warnings.push(message);
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_str;
    use std::path::Path;

    fn workflow(text: &str) -> Workflow {
        parse_str(text, Path::new("test.flow")).unwrap()
    }

    #[test]
    fn test_effective_config_cli_wins() {
        let wf = workflow("ADAPTER mock\nCOMPACTION-THRESHOLD 70\nMAX-CYCLES 3\nPROMPT hi\n");
        let options = EngineOptions {
            compaction_threshold: Some(85),
            max_cycles: Some(CycleLimit::Bounded(9)),
            ..EngineOptions::default()
        };
        let config = EffectiveConfig::resolve(&wf, &options);
        assert_eq!(config.compaction.background, 85);
        assert_eq!(config.max_cycles, CycleLimit::Bounded(9));
    }

    #[test]
    fn test_effective_config_workflow_over_defaults() {
        let wf = workflow("ADAPTER mock\nCOMPACTION-THRESHOLD 70\nPROMPT hi\n");
        let config = EffectiveConfig::resolve(&wf, &EngineOptions::default());
        assert_eq!(config.compaction.background, 70);
        assert_eq!(config.compaction.min, 30);
        assert_eq!(config.compaction.max, 95);
    }

    #[test]
    fn test_cancellation_handle_idempotent() {
        let handle = CancellationHandle::default();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_validate_workflow_unknown_directive() {
        let wf = workflow("ADAPTER mock\nFROBNICATE hard\n");
        let dir = tempfile::tempdir().unwrap();
        let err = validate_workflow(&wf, dir.path(), Some(true), false, &[]).unwrap_err();
        assert!(err.to_string().contains("FROBNICATE"));
        let warnings = validate_workflow(&wf, dir.path(), Some(false), false, &[]).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_validate_workflow_is_idempotent() {
        let wf = workflow("ADAPTER mock\nPROMPT hi\n");
        let dir = tempfile::tempdir().unwrap();
        let first = validate_workflow(&wf, dir.path(), None, false, &[]).unwrap();
        let second = validate_workflow(&wf, dir.path(), None, false, &[]).unwrap();
        assert_eq!(first, second);
    }
}
