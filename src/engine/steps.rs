//! Per-step executors.
//!
//! Every send funnels through [`Engine::send`], which enforces the
//! compaction thresholds before the call and synchronizes token counts,
//! the transcript, metrics and the loop guard after it.

use super::async_procs::AsyncRegistry;
use super::Engine;
use crate::adapter::{AdapterSessionConfig, CompactionResult, SendResponse};
use crate::context::RefPattern;
use crate::error::{Error, Result};
use crate::render::BranchTaken;
use crate::session::metrics::CompactionEvent;
use crate::session::{CheckpointStatus, SessionPhase};
use crate::subprocess::{ExitStatus, ProcessCommand, ProcessError, ProcessOutput};
use crate::workflow::{
    CompactStep, ConsultStep, CustomStep, OnError, OutputPolicy, PreserveCategory, PromptStep,
    RunStep, Step, VerifyStep,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Bound the stderr snippet folded into retry prompts.
const STDERR_SNIPPET_LIMIT: usize = 500;

fn stderr_snippet(stderr: &str) -> &str {
    let mut cut = stderr.len().min(STDERR_SNIPPET_LIMIT);
    while cut > 0 && !stderr.is_char_boundary(cut) {
        cut -= 1;
    }
    &stderr[..cut]
}

impl Engine {
    // ------------------------------------------------------------------
    // prompt
    // ------------------------------------------------------------------

    pub(crate) async fn execute_prompt(
        &mut self,
        step: &Step,
        prompt: &PromptStep,
        index: usize,
    ) -> Result<()> {
        let text = self.expand(&prompt.text)?;
        if prompt.elide_into_next {
            // This prompt's text joins the next assistant turn instead of
            // consuming one of its own.
            self.buffer.push_elided(text);
            self.record_step(step, json!({ "elided": true }), None);
            return Ok(());
        }

        let mut body_text = text;
        if Some(index) == self.last_prompt_index {
            if let Some(epilogue) = self.workflow.header.decorations.epilogue.clone() {
                let epilogue = self.expand(&epilogue)?;
                body_text.push_str("\n\n");
                body_text.push_str(&epilogue);
            }
        }
        let decorations = self.workflow.header.decorations.clone();
        let body = self.buffer.assemble(&body_text, &decorations);
        let response = self.send(&body).await?;
        self.record_step(
            step,
            json!({ "prompt": body, "response": response.text, "tool_calls": response.tool_calls }),
            None,
        );
        Ok(())
    }

    /// The single send path: compaction guard before, token/transcript/
    /// metrics/loop-guard synchronization after.
    pub(crate) async fn send(&mut self, body: &str) -> Result<SendResponse> {
        self.compaction_guard().await?;
        let response = match self.adapter.send(&mut self.adapter_session, body).await {
            Ok(response) => response,
            Err(e @ Error::RateLimited(_)) => {
                // Fatal within the run; users resume after cooldown.
                self.save_checkpoint(CheckpointStatus::Error, Some(e.to_string()), None)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.session.record_turn(&response);
        self.store
            .append_transcript(&self.session.id, body, &response.text)?;
        self.session.metrics.save(&self.session.dir)?;
        self.guard.observe(&response)?;
        Ok(response)
    }

    /// Threshold policy ahead of a send: past COMPACTION-MAX the send is
    /// blocked until a compaction completes; past the background threshold
    /// infinite sessions compact opportunistically.
    async fn compaction_guard(&mut self) -> Result<()> {
        let percent = self.session.percent_used();
        let thresholds = self.config.compaction;
        if percent >= thresholds.max as f64 {
            info!(
                "context at {percent:.0}% >= max {}%, compacting before send",
                thresholds.max
            );
            self.run_compaction(None).await?;
        } else if percent >= thresholds.background as f64
            && self.config.infinite_sessions
            && self.adapter.capabilities().background_compaction
        {
            self.run_compaction(None).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_compaction(
        &mut self,
        preserve_override: Option<&BTreeSet<PreserveCategory>>,
    ) -> Result<CompactionResult> {
        if !self.adapter.capabilities().compaction {
            return Err(crate::adapter::not_supported(self.adapter.name(), "compact"));
        }
        self.session.transition(SessionPhase::Compacting)?;
        let preserve = preserve_override
            .cloned()
            .unwrap_or_else(|| self.workflow.header.compact_preserve.clone());
        let result = self
            .adapter
            .compact(&mut self.adapter_session, &preserve)
            .await?;
        self.session.metrics.record_compaction(CompactionEvent {
            before: result.tokens_before,
            after: result.tokens_after,
            preserved: preserve.iter().map(|c| c.to_string()).collect(),
            timestamp: chrono::Utc::now(),
        });
        let usage = self.adapter.context_usage(&self.adapter_session).await?;
        self.session.sync_usage(&usage);
        self.session.transition(SessionPhase::Running)?;
        self.session.metrics.save(&self.session.dir)?;
        if let Some(advisory) = self.session.compaction_ineffective() {
            warn!("{advisory}");
            self.warnings.push(advisory);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // run
    // ------------------------------------------------------------------

    pub(crate) async fn execute_run(
        &mut self,
        step: &Step,
        run: &RunStep,
        index: usize,
    ) -> Result<()> {
        let command_line = self.expand(&run.command)?;
        let mut command =
            ProcessCommand::from_command_line(&command_line, self.config.allow_shell)
                .map_err(|e| Error::Validation(format!("bad RUN command: {e}")))?;
        for (key, value) in &run.env {
            command.env.insert(key.clone(), self.expand(value)?);
        }
        command.working_dir = Some(match &run.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => self.config.workspace.join(cwd),
            None => self.config.workspace.clone(),
        });
        command.timeout = Some(run.timeout);
        command.output_limit = run.output_limit;

        if run.run_async {
            let name = AsyncRegistry::handle_name(run, index);
            let runner = Arc::clone(&self.runner);
            let join = tokio::spawn(async move { runner.run(command).await });
            self.asyncs
                .register(name.clone(), command_line, run.output_policy, join)?;
            self.record_step(step, json!({ "async_handle": name }), None);
            return Ok(());
        }

        let mut attempts_left = match &run.on_error {
            OnError::Retry { attempts, .. } => *attempts,
            _ => 0,
        };
        let mut retries_used = 0u32;
        let mut output = self.run_once(command.clone()).await?;
        while !output.success() && attempts_left > 0 {
            attempts_left -= 1;
            retries_used += 1;
            if let OnError::Retry { prompt, .. } = &run.on_error {
                let prompt = self.expand(prompt)?;
                let retry_body = format!(
                    "{prompt}\n\n--- stderr of {command_line} ---\n{}",
                    stderr_snippet(&output.stderr)
                );
                self.send(&retry_body).await?;
            }
            output = self.run_once(command.clone()).await?;
        }

        let failed = !output.success();
        self.capture_output(&command_line, run.output_policy, run.elide_into_next, &output);

        let branch = if failed && !run.failure_block.is_empty() {
            Some(BranchTaken::Failure)
        } else if !failed && !run.success_block.is_empty() {
            Some(BranchTaken::Success)
        } else {
            None
        };
        self.record_step(
            step,
            json!({
                "exit_code": output.status.code(),
                "timed_out": output.status == ExitStatus::Timeout,
                "retries": retries_used,
                "stdout": output.stdout,
                "stderr": output.stderr,
            }),
            Some(branch.unwrap_or(BranchTaken::None)),
        );

        if let Some(taken) = branch {
            let block = match taken {
                BranchTaken::Failure => run.failure_block.clone(),
                BranchTaken::Success => run.success_block.clone(),
                BranchTaken::None => Vec::new(),
            };
            self.execute_block(&block).await?;
            if taken == BranchTaken::Failure {
                // An authored failure block handles the failure.
                return Ok(());
            }
        }

        if failed {
            match &run.on_error {
                OnError::Continue => {
                    self.warnings.push(format!(
                        "RUN {command_line} failed (exit {:?}), continuing",
                        output.status.code()
                    ));
                }
                OnError::Stop | OnError::Retry { .. } => {
                    return Err(self.run_failure(&command_line, &output));
                }
            }
        }
        Ok(())
    }

    fn run_failure(&self, command: &str, output: &ProcessOutput) -> Error {
        match output.status {
            ExitStatus::Timeout => Error::RunTimeout {
                command: command.to_string(),
                seconds: output.duration.as_secs(),
            },
            _ => Error::Run {
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
            },
        }
    }

    /// Execute, translating timeout and missing-binary into failed output
    /// so the on-error policy can decide.
    async fn run_once(&mut self, command: ProcessCommand) -> Result<ProcessOutput> {
        match self.runner.run(command).await {
            Ok(output) => Ok(output),
            Err(ProcessError::Timeout(limit)) => Ok(ProcessOutput {
                status: ExitStatus::Timeout,
                stdout: String::new(),
                stderr: format!("timed out after {limit:?}"),
                duration: limit,
                stdout_truncated: false,
                stderr_truncated: false,
            }),
            Err(ProcessError::CommandNotFound(program)) => Ok(ProcessOutput {
                status: ExitStatus::Error(127),
                stdout: String::new(),
                stderr: format!("command not found: {program}"),
                duration: std::time::Duration::ZERO,
                stdout_truncated: false,
                stderr_truncated: false,
            }),
            Err(ProcessError::Tokenize(message)) => Err(Error::Validation(message)),
            Err(ProcessError::Io(e)) => Err(e.into()),
        }
    }

    fn capture_output(
        &mut self,
        label: &str,
        policy: OutputPolicy,
        elide: bool,
        output: &ProcessOutput,
    ) {
        let mut combined = output.stdout.clone();
        if !output.success() && !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&output.stderr);
        }
        if elide {
            self.buffer
                .push_elided(format!("--- output of {label} ---\n{combined}"));
            return;
        }
        let inject = match policy {
            OutputPolicy::Always => true,
            OutputPolicy::OnError => !output.success(),
            OutputPolicy::Never => false,
        };
        if inject {
            self.buffer.push_output(label, &combined);
        }
    }

    /// Branch blocks run inline between the parent RUN and the next outer
    /// step; they never consume a cycle.
    async fn execute_block(&mut self, steps: &[Step]) -> Result<()> {
        let index = self.session.step_index;
        for step in steps {
            self.check_boundary()?;
            self.dispatch(step, index).await?;
        }
        Ok(())
    }

    pub(crate) async fn execute_run_wait(&mut self, step: &Step, handle: &str) -> Result<()> {
        let (info, result) = self.asyncs.wait(handle).await?;
        let output = match result {
            Ok(output) => output,
            Err(ProcessError::Timeout(limit)) => ProcessOutput {
                status: ExitStatus::Timeout,
                stdout: String::new(),
                stderr: format!("timed out after {limit:?}"),
                duration: limit,
                stdout_truncated: false,
                stderr_truncated: false,
            },
            Err(e) => return Err(Error::Internal(format!("async run failed to start: {e}"))),
        };
        self.capture_output(&info.command, info.output_policy, false, &output);
        self.record_step(
            step,
            json!({ "command": info.command, "exit_code": output.status.code() }),
            None,
        );
        if !output.success() {
            return Err(self.run_failure(&info.command, &output));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // verify
    // ------------------------------------------------------------------

    pub(crate) async fn execute_verify(&mut self, step: &Step, verify: &VerifyStep) -> Result<()> {
        let mut args = Vec::with_capacity(verify.args.len());
        for arg in &verify.args {
            args.push(self.expand(arg)?);
        }

        let mut attempts_left = match &verify.on_error {
            OnError::Retry { attempts, .. } => *attempts,
            _ => 0,
        };
        let mut report = self
            .verifiers
            .run(&verify.kind, &self.config.workspace, &args)?;
        while !report.passed && attempts_left > 0 {
            attempts_left -= 1;
            if let OnError::Retry { prompt, .. } = &verify.on_error {
                let prompt = self.expand(prompt)?;
                let retry_body = format!(
                    "{prompt}\n\n--- verifier {} errors ---\n{}",
                    verify.kind,
                    report.errors.join("\n")
                );
                self.send(&retry_body).await?;
            }
            report = self
                .verifiers
                .run(&verify.kind, &self.config.workspace, &args)?;
        }

        let inject = match verify.output_policy {
            OutputPolicy::Always => true,
            OutputPolicy::OnError => !report.passed,
            OutputPolicy::Never => false,
        };
        if inject {
            let mut text = report.output.clone();
            for error in &report.errors {
                text.push('\n');
                text.push_str(error);
            }
            let (text, _) = crate::subprocess::runner::truncate_stream(&text, verify.output_limit);
            self.buffer.push_output(&format!("verify {}", verify.kind), &text);
        }
        self.warnings.extend(report.warnings.iter().cloned());
        self.record_step(
            step,
            json!({
                "passed": report.passed,
                "errors": report.errors,
                "warnings": report.warnings,
            }),
            None,
        );

        if !report.passed {
            match &verify.on_error {
                OnError::Continue => {
                    self.warnings.push(format!(
                        "verify {} reported {} error(s), continuing",
                        verify.kind,
                        report.errors.len()
                    ));
                }
                OnError::Stop | OnError::Retry { .. } => {
                    return Err(Error::VerifyFailure {
                        kind: verify.kind.clone(),
                        errors: report.errors.len(),
                    });
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // context inject
    // ------------------------------------------------------------------

    pub(crate) fn execute_inject(&mut self, step: &Step, patterns: &[RefPattern]) -> Result<()> {
        let resolved = self
            .resolver
            .resolve(patterns, &self.workflow.context_excludes)?;
        for miss in &resolved.misses {
            self.warnings
                .push(format!("context {miss} matched no files"));
        }
        let count = resolved.files.len();
        self.buffer.push_context(&resolved.files);
        self.record_step(step, json!({ "files": count }), None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // compact / checkpoint / pause / consult
    // ------------------------------------------------------------------

    pub(crate) async fn execute_compact(&mut self, step: &Step, compact: &CompactStep) -> Result<()> {
        let percent = self.session.percent_used();
        let min = self.config.compaction.min;
        if percent < min as f64 {
            let warning = format!(
                "COMPACT skipped: context at {percent:.0}% is below COMPACTION-MIN {min}%"
            );
            warn!("{warning}");
            self.warnings.push(warning);
            self.record_step(step, json!({ "skipped": true }), None);
            return Ok(());
        }
        if let Some(prologue) = &compact.prologue {
            let prologue = self.expand(prologue)?;
            self.send(&prologue).await?;
        }
        let result = self.run_compaction(compact.preserve.as_ref()).await?;
        if let Some(epilogue) = &compact.epilogue {
            let epilogue = self.expand(epilogue)?;
            self.send(&epilogue).await?;
        }
        self.record_step(
            step,
            json!({
                "tokens_before": result.tokens_before,
                "tokens_after": result.tokens_after,
                "preserved_items": result.preserved_items,
            }),
            None,
        );
        Ok(())
    }

    pub(crate) fn execute_checkpoint(&mut self, step: &Step, name: &str) -> Result<()> {
        let name = self.expand(name)?;
        self.save_checkpoint(CheckpointStatus::Running, Some(name.clone()), None)?;
        self.record_step(step, json!({ "name": name }), None);
        Ok(())
    }

    pub(crate) fn execute_pause(&mut self, _step: &Step, message: Option<String>) -> Result<()> {
        let message = match message {
            Some(m) => Some(self.expand(&m)?),
            None => None,
        };
        self.session.transition(SessionPhase::Paused)?;
        self.save_checkpoint(CheckpointStatus::Paused, message, None)?;
        info!("session {} paused", self.session.id);
        Err(Error::Paused(self.session.id.clone()))
    }

    pub(crate) fn execute_consult(&mut self, _step: &Step, consult: &ConsultStep) -> Result<()> {
        let topic = self.expand(&consult.topic)?;
        self.session.transition(SessionPhase::Consulting)?;
        self.save_checkpoint(CheckpointStatus::Consulting, None, Some(topic.clone()))?;
        info!(
            "session {} consulting on {topic:?}",
            self.session.id
        );
        Err(Error::Consulting(self.session.id.clone()))
    }

    // ------------------------------------------------------------------
    // new conversation / custom
    // ------------------------------------------------------------------

    pub(crate) async fn execute_new_conversation(&mut self, step: &Step) -> Result<()> {
        let config = AdapterSessionConfig {
            model: None,
            session_name: None,
            mode: self.config.mode,
            infinite: self.config.infinite_sessions,
        };
        self.adapter_session = self.adapter.create_session(&config).await?;
        self.register_event_sink()?;
        let usage = self.adapter.context_usage(&self.adapter_session).await?;
        self.session.sync_usage(&usage);
        self.record_step(
            step,
            json!({ "conversation": self.adapter_session.id }),
            None,
        );
        Ok(())
    }

    pub(crate) async fn execute_custom(&mut self, step: &Step, custom: &CustomStep) -> Result<()> {
        if !self.plugins.knows(&custom.name) {
            // Strict mode already rejected this at engine construction.
            self.warnings
                .push(format!("skipping unknown directive {}", custom.name));
            self.record_step(step, json!({ "skipped": true }), None);
            return Ok(());
        }
        let args = self.expand(&custom.args)?;
        let report = self
            .plugins
            .dispatch(
                &custom.name,
                &args,
                self.config.mode,
                self.session.cycle,
                self.session.step_index,
            )
            .await?;
        if !report.output.is_empty() || !report.errors.is_empty() {
            let mut text = report.output.clone();
            for error in &report.errors {
                text.push('\n');
                text.push_str(error);
            }
            if !report.passed {
                self.buffer
                    .push_output(&custom.name.to_lowercase(), &text);
            }
        }
        self.record_step(
            step,
            json!({ "passed": report.passed, "errors": report.errors }),
            None,
        );
        if !report.passed {
            return Err(Error::VerifyFailure {
                kind: custom.name.clone(),
                errors: report.errors.len().max(1),
            });
        }
        Ok(())
    }
}
