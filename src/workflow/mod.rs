//! Workflow model: the typed, immutable result of parsing a workflow file.
//!
//! A workflow is header metadata plus an ordered list of steps. The header
//! is fixed once parsing completes; steps are tagged variants dispatched by
//! the iteration engine to their executors.

pub mod model_req;
pub mod parser;

pub use model_req::{ModelRequirement, ModelSpec};
pub use parser::{parse_file, parse_str};

use crate::context::{ContextRequirement, RefPattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Execution mode for the whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Full,
    ReadOnly,
    Audit,
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "read-only" | "readonly" => Ok(Mode::ReadOnly),
            "audit" => Ok(Mode::Audit),
            other => Err(format!("unknown mode {other:?} (expected full, read-only or audit)")),
        }
    }
}

/// Validation policy for unknown directives, templates and context misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

impl ValidationMode {
    pub fn is_strict(&self) -> bool {
        matches!(self, ValidationMode::Strict)
    }
}

/// Bound on the outer cycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleLimit {
    Bounded(u32),
    Unbounded,
}

impl Default for CycleLimit {
    fn default() -> Self {
        CycleLimit::Bounded(1)
    }
}

impl CycleLimit {
    /// Whether the 1-based `cycle` is within the limit.
    pub fn admits(&self, cycle: u32) -> bool {
        match self {
            CycleLimit::Bounded(n) => cycle <= *n,
            CycleLimit::Unbounded => true,
        }
    }
}

/// Compaction thresholds as percentages of the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionThresholds {
    /// Below this, explicit COMPACT is skipped with a warning.
    pub min: u8,
    /// Background compaction begins here when supported.
    pub background: u8,
    /// Sends block here until a compaction completes.
    pub max: u8,
}

impl Default for CompactionThresholds {
    fn default() -> Self {
        Self {
            min: 30,
            background: 80,
            max: 95,
        }
    }
}

/// Conversation categories preserved across compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreserveCategory {
    Prompts,
    Errors,
    ToolResults,
    FileChanges,
    Decisions,
}

impl PreserveCategory {
    pub fn default_set() -> BTreeSet<PreserveCategory> {
        [
            PreserveCategory::Prompts,
            PreserveCategory::Errors,
            PreserveCategory::ToolResults,
        ]
        .into_iter()
        .collect()
    }
}

impl std::str::FromStr for PreserveCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompts" => Ok(Self::Prompts),
            "errors" => Ok(Self::Errors),
            "tool-results" | "tool_results" => Ok(Self::ToolResults),
            "file-changes" | "file_changes" => Ok(Self::FileChanges),
            "decisions" => Ok(Self::Decisions),
            other => Err(format!("unknown preserve category {other:?}")),
        }
    }
}

impl std::fmt::Display for PreserveCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prompts => "prompts",
            Self::Errors => "errors",
            Self::ToolResults => "tool-results",
            Self::FileChanges => "file-changes",
            Self::Decisions => "decisions",
        };
        f.write_str(s)
    }
}

/// Text wrapped around prompts: PROLOGUE/EPILOGUE per cycle, HEADER/FOOTER
/// per prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDecorations {
    pub prologue: Option<String>,
    pub epilogue: Option<String>,
    pub header: Option<String>,
    pub footer: Option<String>,
}

/// Header metadata, immutable after parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHeader {
    pub model: Option<ModelSpec>,
    pub adapter: Option<String>,
    pub mode: Mode,
    pub max_cycles: CycleLimit,
    pub session_name: Option<String>,
    pub validation_mode: ValidationMode,
    pub infinite_sessions: bool,
    #[serde(default)]
    pub compaction: CompactionThresholds,
    pub compact_preserve: BTreeSet<PreserveCategory>,
    pub allow_shell: bool,
    #[serde(default, with = "humantime_serde::option")]
    pub consult_timeout: Option<Duration>,
    #[serde(default)]
    pub decorations: PromptDecorations,
    /// HELP / HELP-INLINE text, shown by `show`, never sent to the adapter.
    #[serde(default)]
    pub help: Vec<String>,
}

/// Policy for injecting captured output into the next prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputPolicy {
    Always,
    #[default]
    OnError,
    Never,
}

impl std::str::FromStr for OutputPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-error" | "onerror" => Ok(Self::OnError),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown output policy {other:?}")),
        }
    }
}

/// What to do when a RUN or VERIFY step fails.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry {
        attempts: u32,
        prompt: String,
    },
}

/// Default per-stream capture limit for RUN and VERIFY output.
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024;

/// Default RUN timeout.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStep {
    pub text: String,
    /// Set by ELIDE on this step: fold this step's turn into the next prompt.
    #[serde(default)]
    pub elide_into_next: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub command: String,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub output_policy: OutputPolicy,
    pub output_limit: usize,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub run_async: bool,
    /// Handle name for RUN-ASYNC; defaults to `run-<step-index>`.
    pub handle: Option<String>,
    #[serde(default)]
    pub elide_into_next: bool,
    #[serde(default)]
    pub success_block: Vec<Step>,
    #[serde(default)]
    pub failure_block: Vec<Step>,
}

impl RunStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: DEFAULT_RUN_TIMEOUT,
            output_policy: OutputPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            on_error: OnError::default(),
            run_async: false,
            handle: None,
            elide_into_next: false,
            success_block: Vec::new(),
            failure_block: Vec::new(),
        }
    }

    pub fn has_blocks(&self) -> bool {
        !self.success_block.is_empty() || !self.failure_block.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyStep {
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub output_policy: OutputPolicy,
    pub output_limit: usize,
}

impl VerifyStep {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            args,
            on_error: OnError::default(),
            output_policy: OutputPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompactStep {
    /// Override of the header preserve set for this compaction.
    pub preserve: Option<BTreeSet<PreserveCategory>>,
    pub prologue: Option<String>,
    pub epilogue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultStep {
    pub topic: String,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomStep {
    /// Directive keyword, uppercase canonical.
    pub name: String,
    pub args: String,
}

/// A single unit of work in authored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Step {
    Prompt(PromptStep),
    Run(RunStep),
    RunWait { handle: String },
    Verify(VerifyStep),
    ContextInject { patterns: Vec<RefPattern> },
    Compact(CompactStep),
    Checkpoint { name: String },
    Pause { message: Option<String> },
    Consult(ConsultStep),
    NewConversation,
    Custom(CustomStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Prompt(_) => "prompt",
            Step::Run(_) => "run",
            Step::RunWait { .. } => "run-wait",
            Step::Verify(_) => "verify",
            Step::ContextInject { .. } => "context-inject",
            Step::Compact(_) => "compact",
            Step::Checkpoint { .. } => "checkpoint",
            Step::Pause { .. } => "pause",
            Step::Consult(_) => "consult",
            Step::NewConversation => "new-conversation",
            Step::Custom(_) => "custom",
        }
    }

    /// Whether ELIDE may attach to this step.
    pub fn supports_elision(&self) -> bool {
        matches!(self, Step::Prompt(_) | Step::Run(_))
    }

    pub fn elides_into_next(&self) -> bool {
        match self {
            Step::Prompt(p) => p.elide_into_next,
            Step::Run(r) => r.elide_into_next,
            _ => false,
        }
    }
}

/// The parsed unit: immutable header, context requirements, ordered steps
/// and a content hash over the fully included, pre-template text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub header: WorkflowHeader,
    pub required_context: Vec<ContextRequirement>,
    pub context_excludes: Vec<RefPattern>,
    pub steps: Vec<Step>,
    pub hash: String,
    pub source_path: PathBuf,
}

impl Workflow {
    /// File stem of the source path. Deliberately excluded from the default
    /// template-variable set; only `__WORKFLOW_NAME__` exposes it.
    pub fn name(&self) -> String {
        self.source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string())
    }

    /// Count of prompt steps after elision collapsing, i.e. assistant turns
    /// a single cycle consumes at most.
    pub fn planned_turns(&self) -> usize {
        let mut turns = 0usize;
        let mut pending_elide = false;
        for step in &self.steps {
            match step {
                Step::Prompt(p) => {
                    if !pending_elide {
                        turns += 1;
                    }
                    pending_elide = p.elide_into_next;
                }
                Step::Run(r) => {
                    if !r.elide_into_next {
                        pending_elide = false;
                    }
                }
                _ => pending_elide = false,
            }
        }
        turns
    }
}
