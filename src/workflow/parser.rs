//! Line-oriented workflow parser.
//!
//! A directive is `KEYWORD ARGS` at the start of a non-blank, non-comment
//! line; keywords are case-insensitive on input. `KEYWORD |` opens a
//! continuation body of indented lines. `INCLUDE` is textual substitution
//! at parse time with cycle detection. `ON-FAILURE`/`ON-SUCCESS` ... `END`
//! delimit single-level branch blocks attached to the preceding RUN.

use super::{
    CompactStep, ConsultStep, CustomStep, CycleLimit, ModelRequirement, ModelSpec, OnError,
    OutputPolicy, PreserveCategory, PromptStep, RunStep, Step, ValidationMode, VerifyStep,
    Workflow, WorkflowHeader,
};
use crate::context::{ContextRequirement, RefPattern};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// One physical line with its origin, preserved through INCLUDE expansion.
#[derive(Debug, Clone)]
struct SourceLine {
    path: PathBuf,
    line: usize,
    text: String,
}

/// Parse a workflow file from disk.
pub fn parse_file(path: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Validation(format!("cannot read workflow {}: {e}", path.display()))
    })?;
    parse_str(&text, path)
}

/// Parse workflow text. INCLUDE paths resolve relative to `path`'s parent.
pub fn parse_str(text: &str, path: &Path) -> Result<Workflow> {
    let mut stack = vec![canonical(path)];
    let lines = expand_includes(text, path, &mut stack)?;

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.text.as_bytes());
        hasher.update(b"\n");
    }
    let hash = format!("sha256:{:x}", hasher.finalize());

    let mut parser = Parser::new(path.to_path_buf());
    parser.run(&lines)?;
    let (header, required_context, context_excludes, steps) = parser.finish()?;

    debug!(
        "parsed workflow {} ({} steps, hash {})",
        path.display(),
        steps.len(),
        &hash[..16.min(hash.len())]
    );

    Ok(Workflow {
        header,
        required_context,
        context_excludes,
        steps,
        hash,
        source_path: path.to_path_buf(),
    })
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn expand_includes(text: &str, path: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<SourceLine>> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim_start();
        let keyword = trimmed.split_whitespace().next().unwrap_or("");
        if raw == trimmed && keyword.eq_ignore_ascii_case("INCLUDE") {
            let target = trimmed[keyword.len()..].trim();
            if target.is_empty() {
                return Err(Error::parse(path, line_no, 1, "INCLUDE requires a path"));
            }
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let included = base.join(target);
            let resolved = canonical(&included);
            if stack.contains(&resolved) {
                return Err(Error::parse(
                    path,
                    line_no,
                    1,
                    format!("INCLUDE cycle through {}", included.display()),
                ));
            }
            let body = std::fs::read_to_string(&included).map_err(|e| {
                Error::parse(
                    path,
                    line_no,
                    1,
                    format!("cannot INCLUDE {}: {e}", included.display()),
                )
            })?;
            stack.push(resolved);
            out.extend(expand_includes(&body, &included, stack)?);
            stack.pop();
        } else {
            out.push(SourceLine {
                path: path.to_path_buf(),
                line: line_no,
                text: raw.to_string(),
            });
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Failure,
    Success,
}

struct OpenBlock {
    kind: BlockKind,
    steps: Vec<Step>,
    opened_at: (PathBuf, usize),
}

struct Parser {
    source_path: PathBuf,
    header: WorkflowHeader,
    header_done: bool,
    required_context: Vec<ContextRequirement>,
    context_excludes: Vec<RefPattern>,
    steps: Vec<Step>,
    block: Option<OpenBlock>,
}

impl Parser {
    fn new(source_path: PathBuf) -> Self {
        Self {
            source_path,
            header: WorkflowHeader {
                compact_preserve: PreserveCategory::default_set(),
                ..WorkflowHeader::default()
            },
            header_done: false,
            required_context: Vec::new(),
            context_excludes: Vec::new(),
            steps: Vec::new(),
            block: None,
        }
    }

    fn run(&mut self, lines: &[SourceLine]) -> Result<()> {
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            let trimmed = line.text.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                i += 1;
                continue;
            }
            if line.text.starts_with(char::is_whitespace) {
                return Err(self.err(line, 1, "unexpected indented line outside a continuation body"));
            }

            let keyword_raw = trimmed.split_whitespace().next().unwrap_or("");
            let keyword = keyword_raw.to_ascii_uppercase();
            let mut args = trimmed[keyword_raw.len()..].trim().to_string();

            // Continuation form: `KEYWORD |` folds indented lines into ARGS.
            if args == "|" {
                let (body, consumed) = self.continuation_body(lines, i)?;
                args = body;
                i += consumed;
            }

            self.directive(line, &keyword, &args)?;
            i += 1;
        }
        Ok(())
    }

    /// Collect the indented body following a `KEYWORD |` line. Returns the
    /// dedented body and the number of extra lines consumed.
    fn continuation_body(&self, lines: &[SourceLine], at: usize) -> Result<(String, usize)> {
        let mut body: Vec<&SourceLine> = Vec::new();
        for line in &lines[at + 1..] {
            let blank = line.text.trim().is_empty();
            if !blank && !line.text.starts_with(char::is_whitespace) {
                break;
            }
            body.push(line);
        }
        // Trailing blanks belong to whatever follows, not the body.
        while body.last().is_some_and(|l| l.text.trim().is_empty()) {
            body.pop();
        }
        if body.is_empty() {
            return Err(self.err(&lines[at], 1, "unclosed continuation form: no indented body"));
        }
        let indent = body
            .iter()
            .filter(|l| !l.text.trim().is_empty())
            .map(|l| l.text.len() - l.text.trim_start().len())
            .min()
            .unwrap_or(0);
        let text = body
            .iter()
            .map(|l| {
                if l.text.len() >= indent {
                    &l.text[indent..]
                } else {
                    l.text.trim_start()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok((text, body.len()))
    }

    fn err(&self, line: &SourceLine, column: usize, message: impl Into<String>) -> Error {
        Error::parse(line.path.clone(), line.line, column, message)
    }

    fn header_directive(&self, line: &SourceLine) -> Result<()> {
        if self.header_done {
            Err(self.err(
                line,
                1,
                "header directive after the first executable step",
            ))
        } else {
            Ok(())
        }
    }

    /// The vec new steps land in: the open block's body or the main list.
    fn sink(&mut self) -> &mut Vec<Step> {
        match &mut self.block {
            Some(block) => &mut block.steps,
            None => &mut self.steps,
        }
    }

    fn push_step(&mut self, step: Step) {
        self.header_done = true;
        self.sink().push(step);
    }

    fn last_run_mut(&mut self) -> Option<&mut RunStep> {
        match self.sink().last_mut() {
            Some(Step::Run(run)) => Some(run),
            _ => None,
        }
    }

    fn last_verify_mut(&mut self) -> Option<&mut VerifyStep> {
        match self.sink().last_mut() {
            Some(Step::Verify(v)) => Some(v),
            _ => None,
        }
    }

    fn directive(&mut self, line: &SourceLine, keyword: &str, args: &str) -> Result<()> {
        match keyword {
            // -- header: model and adapter selection ------------------------
            "MODEL" => {
                self.header_directive(line)?;
                self.require_args(line, keyword, args)?;
                let spec = self.header.model.get_or_insert_with(ModelSpec::default);
                spec.id = Some(args.to_string());
            }
            "MODEL-REQUIRES" | "MODEL-PREFERS" => {
                self.header_directive(line)?;
                self.require_args(line, keyword, args)?;
                let mut reqs = Vec::new();
                for token in args.split_whitespace() {
                    let req: ModelRequirement = token
                        .parse()
                        .map_err(|e: String| self.err(line, 1, e))?;
                    reqs.push(req);
                }
                let spec = self.header.model.get_or_insert_with(ModelSpec::default);
                if keyword == "MODEL-REQUIRES" {
                    spec.requires.extend(reqs);
                } else {
                    spec.prefers.extend(reqs);
                }
            }
            "MODEL-POLICY" => {
                self.header_directive(line)?;
                self.require_args(line, keyword, args)?;
                let spec = self.header.model.get_or_insert_with(ModelSpec::default);
                spec.policy = Some(args.to_string());
            }
            "ADAPTER" => {
                self.header_directive(line)?;
                self.require_args(line, keyword, args)?;
                self.header.adapter = Some(args.to_string());
            }
            "MODE" => {
                self.header_directive(line)?;
                self.header.mode = args.parse().map_err(|e: String| self.err(line, 1, e))?;
            }
            "MAX-CYCLES" => {
                self.header_directive(line)?;
                self.header.max_cycles = match args.to_ascii_lowercase().as_str() {
                    "unbounded" | "infinite" => CycleLimit::Unbounded,
                    n => CycleLimit::Bounded(n.parse().map_err(|_| {
                        self.err(line, 1, format!("MAX-CYCLES expects an integer or 'unbounded', got {n:?}"))
                    })?),
                };
            }
            "SESSION-NAME" => {
                self.header_directive(line)?;
                self.require_args(line, keyword, args)?;
                self.header.session_name = Some(args.to_string());
            }
            "VALIDATION-MODE" => {
                self.header_directive(line)?;
                self.header.validation_mode = match args.to_ascii_lowercase().as_str() {
                    "strict" => ValidationMode::Strict,
                    "lenient" => ValidationMode::Lenient,
                    other => {
                        return Err(self.err(
                            line,
                            1,
                            format!("VALIDATION-MODE expects strict or lenient, got {other:?}"),
                        ))
                    }
                };
            }
            "INFINITE-SESSIONS" => {
                self.header_directive(line)?;
                self.header.infinite_sessions = self.parse_flag(line, args)?;
            }
            "ALLOW-SHELL" => {
                self.header_directive(line)?;
                self.header.allow_shell = self.parse_flag(line, args)?;
            }
            "COMPACTION-MIN" => {
                self.header_directive(line)?;
                self.header.compaction.min = self.parse_percent(line, keyword, args)?;
            }
            "COMPACTION-THRESHOLD" => {
                self.header_directive(line)?;
                self.header.compaction.background = self.parse_percent(line, keyword, args)?;
            }
            "COMPACTION-MAX" => {
                self.header_directive(line)?;
                self.header.compaction.max = self.parse_percent(line, keyword, args)?;
            }
            "COMPACT-PRESERVE" => {
                self.header_directive(line)?;
                self.header.compact_preserve = self.parse_preserve(line, args)?;
            }

            // -- context -----------------------------------------------------
            "CONTEXT" | "CONTEXT-OPTIONAL" | "REQUIRE" => {
                self.require_args(line, keyword, args)?;
                let pattern = RefPattern::parse(args).map_err(|e| self.err(line, 1, e.to_string()))?;
                if self.header_done {
                    // Mid-workflow context resolves into the next prompt.
                    self.push_step(Step::ContextInject {
                        patterns: vec![pattern],
                    });
                } else {
                    self.required_context.push(ContextRequirement {
                        pattern,
                        optional: keyword == "CONTEXT-OPTIONAL",
                        inject: keyword != "REQUIRE",
                    });
                }
            }
            "CONTEXT-EXCLUDE" => {
                self.require_args(line, keyword, args)?;
                let pattern = RefPattern::parse(args).map_err(|e| self.err(line, 1, e.to_string()))?;
                self.context_excludes.push(pattern);
            }
            "REFCAT" => {
                self.require_args(line, keyword, args)?;
                let mut patterns = Vec::new();
                for token in args.split_whitespace() {
                    patterns.push(
                        RefPattern::parse(token).map_err(|e| self.err(line, 1, e.to_string()))?,
                    );
                }
                self.push_step(Step::ContextInject { patterns });
            }

            // -- prompting ---------------------------------------------------
            "PROMPT" => {
                self.require_args(line, keyword, args)?;
                self.push_step(Step::Prompt(PromptStep {
                    text: args.to_string(),
                    elide_into_next: false,
                }));
            }
            "PROLOGUE" | "EPILOGUE" => {
                self.require_args(line, keyword, args)?;
                // After a COMPACT step these wrap the compaction itself.
                if let Some(Step::Compact(compact)) = self.sink().last_mut() {
                    if keyword == "PROLOGUE" {
                        compact.prologue = Some(args.to_string());
                    } else {
                        compact.epilogue = Some(args.to_string());
                    }
                } else if keyword == "PROLOGUE" {
                    self.header.decorations.prologue = Some(args.to_string());
                } else {
                    self.header.decorations.epilogue = Some(args.to_string());
                }
            }
            "HEADER" => {
                self.require_args(line, keyword, args)?;
                self.header.decorations.header = Some(args.to_string());
            }
            "FOOTER" => {
                self.require_args(line, keyword, args)?;
                self.header.decorations.footer = Some(args.to_string());
            }
            "HELP" | "HELP-INLINE" => {
                self.require_args(line, keyword, args)?;
                self.header.help.push(args.to_string());
            }
            "ELIDE" => {
                let source = self.err(line, 1, "ELIDE requires a preceding prompt or run step");
                match self.sink().last_mut() {
                    Some(Step::Prompt(p)) => p.elide_into_next = true,
                    Some(Step::Run(r)) => r.elide_into_next = true,
                    _ => return Err(source),
                }
            }

            // -- execution ---------------------------------------------------
            "RUN" => {
                self.require_args(line, keyword, args)?;
                self.push_step(Step::Run(RunStep::new(args)));
            }
            "RUN-CWD" => {
                self.require_args(line, keyword, args)?;
                let cwd = PathBuf::from(args);
                self.modify_run(line, keyword, |run| run.cwd = Some(cwd))?;
            }
            "RUN-ENV" => {
                let (key, value) = args.split_once('=').ok_or_else(|| {
                    self.err(line, 1, "RUN-ENV expects KEY=VALUE")
                })?;
                let (key, value) = (key.trim().to_string(), value.to_string());
                self.modify_run(line, keyword, |run| {
                    run.env.insert(key, value);
                })?;
            }
            "RUN-TIMEOUT" => {
                let timeout = self.parse_duration(line, keyword, args)?;
                self.modify_run(line, keyword, |run| run.timeout = timeout)?;
            }
            "RUN-OUTPUT" => {
                let policy: OutputPolicy =
                    args.parse().map_err(|e: String| self.err(line, 1, e))?;
                self.modify_run(line, keyword, |run| run.output_policy = policy)?;
            }
            "RUN-OUTPUT-LIMIT" => {
                let limit: usize = args.parse().map_err(|_| {
                    self.err(line, 1, format!("RUN-OUTPUT-LIMIT expects bytes, got {args:?}"))
                })?;
                self.modify_run(line, keyword, |run| run.output_limit = limit)?;
            }
            "RUN-ON-ERROR" => {
                let on_error = self.parse_on_error(line, args)?;
                self.modify_run(line, keyword, |run| run.on_error = on_error)?;
            }
            "RUN-RETRY" => {
                let on_error = self.parse_retry(line, args)?;
                self.modify_run(line, keyword, |run| run.on_error = on_error)?;
            }
            "RUN-ASYNC" => {
                let handle = if args.is_empty() {
                    None
                } else {
                    Some(args.to_string())
                };
                self.modify_run(line, keyword, |run| {
                    run.run_async = true;
                    run.handle = handle;
                })?;
            }
            "RUN-WAIT" => {
                self.require_args(line, keyword, args)?;
                self.push_step(Step::RunWait {
                    handle: args.to_string(),
                });
            }
            "ON-FAILURE" | "ON-SUCCESS" => {
                let kind = if keyword == "ON-FAILURE" {
                    BlockKind::Failure
                } else {
                    BlockKind::Success
                };
                self.open_block(line, kind)?;
            }
            "END" => self.close_block(line)?,

            // -- verification ------------------------------------------------
            "VERIFY" => {
                self.require_args(line, keyword, args)?;
                let mut tokens = shell_words::split(args)
                    .map_err(|e| self.err(line, 1, format!("bad VERIFY arguments: {e}")))?;
                if tokens.is_empty() {
                    return Err(self.err(line, 1, "VERIFY requires a verifier kind"));
                }
                let kind = tokens.remove(0);
                self.push_step(Step::Verify(VerifyStep::new(kind, tokens)));
            }
            "VERIFY-ON-ERROR" => {
                let on_error = self.parse_on_error(line, args)?;
                self.modify_verify(line, keyword, |v| v.on_error = on_error)?;
            }
            "VERIFY-OUTPUT" => {
                let policy: OutputPolicy =
                    args.parse().map_err(|e: String| self.err(line, 1, e))?;
                self.modify_verify(line, keyword, |v| v.output_policy = policy)?;
            }
            "VERIFY-LIMIT" => {
                let limit: usize = args.parse().map_err(|_| {
                    self.err(line, 1, format!("VERIFY-LIMIT expects bytes, got {args:?}"))
                })?;
                self.modify_verify(line, keyword, |v| v.output_limit = limit)?;
            }

            // -- session -----------------------------------------------------
            "COMPACT" => {
                let preserve = if args.is_empty() {
                    None
                } else {
                    Some(self.parse_preserve(line, args)?)
                };
                self.push_step(Step::Compact(CompactStep {
                    preserve,
                    prologue: None,
                    epilogue: None,
                }));
            }
            "CHECKPOINT" => {
                self.require_args(line, keyword, args)?;
                self.push_step(Step::Checkpoint {
                    name: args.to_string(),
                });
            }
            "PAUSE" => {
                let message = if args.is_empty() {
                    None
                } else {
                    Some(self.unquote(args))
                };
                self.push_step(Step::Pause { message });
            }
            "CONSULT" => {
                self.require_args(line, keyword, args)?;
                let topic = self.unquote(args);
                let timeout = self.header.consult_timeout;
                self.push_step(Step::Consult(ConsultStep { topic, timeout }));
            }
            "CONSULT-TIMEOUT" => {
                let timeout = self.parse_duration(line, keyword, args)?;
                // Attaches to the preceding CONSULT; before any step it sets
                // the header default for every later CONSULT.
                if let Some(Step::Consult(consult)) = self.sink().last_mut() {
                    consult.timeout = Some(timeout);
                } else if !self.header_done {
                    self.header.consult_timeout = Some(timeout);
                } else {
                    return Err(self.err(
                        line,
                        1,
                        "CONSULT-TIMEOUT requires a preceding CONSULT step",
                    ));
                }
            }
            "NEW-CONVERSATION" => {
                self.push_step(Step::NewConversation);
            }

            // -- anything else: plugin-defined -------------------------------
            _ => {
                self.push_step(Step::Custom(CustomStep {
                    name: keyword.to_string(),
                    args: args.to_string(),
                }));
            }
        }
        Ok(())
    }

    fn open_block(&mut self, line: &SourceLine, kind: BlockKind) -> Result<()> {
        if self.block.is_some() {
            return Err(self.err(line, 1, "branching blocks cannot nest"));
        }
        let run = match self.steps.last() {
            Some(Step::Run(run)) => run,
            _ => {
                return Err(self.err(
                    line,
                    1,
                    "ON-FAILURE/ON-SUCCESS must follow a RUN step",
                ))
            }
        };
        if run.elide_into_next {
            return Err(self.err(line, 1, "ELIDE may not precede a branching block"));
        }
        let exists = match kind {
            BlockKind::Failure => !run.failure_block.is_empty(),
            BlockKind::Success => !run.success_block.is_empty(),
        };
        if exists {
            return Err(self.err(line, 1, "duplicate branch block for this RUN"));
        }
        self.block = Some(OpenBlock {
            kind,
            steps: Vec::new(),
            opened_at: (line.path.clone(), line.line),
        });
        Ok(())
    }

    fn close_block(&mut self, line: &SourceLine) -> Result<()> {
        let block = self
            .block
            .take()
            .ok_or_else(|| self.err(line, 1, "END without an open block"))?;
        if block.steps.last().is_some_and(|s| s.elides_into_next()) {
            return Err(self.err(line, 1, "elision may not cross a block boundary"));
        }
        let run = match self.steps.last_mut() {
            Some(Step::Run(run)) => run,
            _ => return Err(Error::Internal("open block without a parent RUN".into())),
        };
        match block.kind {
            BlockKind::Failure => run.failure_block = block.steps,
            BlockKind::Success => run.success_block = block.steps,
        }
        Ok(())
    }

    fn modify_run(
        &mut self,
        line: &SourceLine,
        keyword: &str,
        apply: impl FnOnce(&mut RunStep),
    ) -> Result<()> {
        match self.last_run_mut() {
            Some(run) => {
                apply(run);
                Ok(())
            }
            None => Err(self.err(
                line,
                1,
                format!("{keyword} requires a preceding RUN step"),
            )),
        }
    }

    fn modify_verify(
        &mut self,
        line: &SourceLine,
        keyword: &str,
        apply: impl FnOnce(&mut VerifyStep),
    ) -> Result<()> {
        match self.last_verify_mut() {
            Some(v) => {
                apply(v);
                Ok(())
            }
            None => Err(self.err(
                line,
                1,
                format!("{keyword} requires a preceding VERIFY step"),
            )),
        }
    }

    fn require_args(&self, line: &SourceLine, keyword: &str, args: &str) -> Result<()> {
        if args.is_empty() {
            Err(self.err(line, 1, format!("{keyword} requires arguments")))
        } else {
            Ok(())
        }
    }

    fn parse_flag(&self, line: &SourceLine, args: &str) -> Result<bool> {
        match args.to_ascii_lowercase().as_str() {
            "" | "on" | "true" | "yes" => Ok(true),
            "off" | "false" | "no" => Ok(false),
            other => Err(self.err(line, 1, format!("expected on/off, got {other:?}"))),
        }
    }

    fn parse_percent(&self, line: &SourceLine, keyword: &str, args: &str) -> Result<u8> {
        let value: u8 = args
            .trim_end_matches('%')
            .parse()
            .map_err(|_| self.err(line, 1, format!("{keyword} expects a percentage, got {args:?}")))?;
        if value == 0 || value > 100 {
            return Err(self.err(line, 1, format!("{keyword} must be in (0,100], got {value}")));
        }
        Ok(value)
    }

    fn parse_preserve(
        &self,
        line: &SourceLine,
        args: &str,
    ) -> Result<std::collections::BTreeSet<PreserveCategory>> {
        let mut set = std::collections::BTreeSet::new();
        for token in args.split([' ', ',']).filter(|t| !t.is_empty()) {
            let category: PreserveCategory =
                token.parse().map_err(|e: String| self.err(line, 1, e))?;
            set.insert(category);
        }
        Ok(set)
    }

    fn parse_duration(&self, line: &SourceLine, keyword: &str, args: &str) -> Result<Duration> {
        if let Ok(seconds) = args.parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }
        humantime::parse_duration(args).map_err(|_| {
            self.err(
                line,
                1,
                format!("{keyword} expects seconds or a duration like '10m', got {args:?}"),
            )
        })
    }

    fn parse_on_error(&self, line: &SourceLine, args: &str) -> Result<OnError> {
        let mut tokens = args.split_whitespace();
        match tokens.next().map(|t| t.to_ascii_lowercase()).as_deref() {
            Some("stop") => Ok(OnError::Stop),
            Some("continue") => Ok(OnError::Continue),
            Some("retry") => {
                let rest: Vec<&str> = tokens.collect();
                self.parse_retry(line, &rest.join(" "))
            }
            _ => Err(self.err(
                line,
                1,
                format!("expected stop, continue or retry N \"prompt\", got {args:?}"),
            )),
        }
    }

    fn parse_retry(&self, line: &SourceLine, args: &str) -> Result<OnError> {
        let (count, rest) = args
            .split_once(char::is_whitespace)
            .unwrap_or((args, ""));
        let attempts: u32 = count.parse().map_err(|_| {
            self.err(line, 1, format!("retry expects a count, got {count:?}"))
        })?;
        let prompt = self.unquote(rest.trim());
        if prompt.is_empty() {
            return Err(self.err(line, 1, "retry requires a retry prompt"));
        }
        Ok(OnError::Retry { attempts, prompt })
    }

    fn unquote(&self, s: &str) -> String {
        match shell_words::split(s) {
            Ok(tokens) if tokens.len() == 1 => tokens.into_iter().next().unwrap(),
            _ => s.to_string(),
        }
    }

    fn finish(
        self,
    ) -> Result<(
        WorkflowHeader,
        Vec<ContextRequirement>,
        Vec<RefPattern>,
        Vec<Step>,
    )> {
        if let Some(block) = &self.block {
            return Err(Error::parse(
                block.opened_at.0.clone(),
                block.opened_at.1,
                1,
                "branch block is missing its END",
            ));
        }
        if self.steps.is_empty() {
            return Err(Error::parse(
                self.source_path.clone(),
                1,
                1,
                "workflow has no executable steps",
            ));
        }
        Ok((
            self.header,
            self.required_context,
            self.context_excludes,
            self.steps,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Workflow> {
        parse_str(text, Path::new("test.flow"))
    }

    #[test]
    fn test_minimal_workflow() {
        let wf = parse("MODEL mock\nADAPTER mock\nMAX-CYCLES 1\nPROMPT Say \"hello\".\n").unwrap();
        assert_eq!(wf.header.adapter.as_deref(), Some("mock"));
        assert_eq!(wf.header.max_cycles, CycleLimit::Bounded(1));
        assert_eq!(wf.steps.len(), 1);
        match &wf.steps[0] {
            Step::Prompt(p) => assert_eq!(p.text, "Say \"hello\"."),
            other => panic!("expected prompt, got {other:?}"),
        }
        assert!(wf.hash.starts_with("sha256:"));
    }

    #[test]
    fn test_empty_workflow_is_parse_error() {
        assert!(parse("").is_err());
        assert!(parse("# only a comment\n\n").is_err());
        assert!(parse("ADAPTER mock\n").is_err());
    }

    #[test]
    fn test_case_insensitive_keywords() {
        let wf = parse("adapter mock\nprompt hi\n").unwrap();
        assert_eq!(wf.header.adapter.as_deref(), Some("mock"));
    }

    #[test]
    fn test_header_after_step_rejected() {
        let err = parse("PROMPT hi\nADAPTER mock\n").unwrap_err();
        assert!(err.to_string().contains("header directive"), "{err}");
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let wf = parse("# workflow\nADAPTER mock\n\n# step\nPROMPT hi\n").unwrap();
        assert_eq!(wf.steps.len(), 1);
    }

    #[test]
    fn test_elide_chain() {
        let wf = parse(
            "ADAPTER mock\nPROMPT Analyze the test run.\nELIDE\nRUN /bin/echo \"ok\"\nELIDE\nPROMPT Summarize.\n",
        )
        .unwrap();
        assert!(matches!(&wf.steps[0], Step::Prompt(p) if p.elide_into_next));
        assert!(matches!(&wf.steps[1], Step::Run(r) if r.elide_into_next));
        assert_eq!(wf.planned_turns(), 1);
    }

    #[test]
    fn test_elide_without_target_rejected() {
        assert!(parse("ELIDE\nPROMPT hi\n").is_err());
        assert!(parse("ADAPTER mock\nPAUSE\nELIDE\n").is_err());
    }

    #[test]
    fn test_branch_blocks() {
        let wf = parse(
            "ADAPTER mock\nRUN /bin/false\nON-FAILURE\nPROMPT Diagnose the failure.\nEND\nPROMPT Proceed.\n",
        )
        .unwrap();
        assert_eq!(wf.steps.len(), 2);
        match &wf.steps[0] {
            Step::Run(run) => {
                assert_eq!(run.failure_block.len(), 1);
                assert!(run.success_block.is_empty());
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_blocks_rejected() {
        let err = parse(
            "RUN /bin/false\nON-FAILURE\nRUN /bin/true\nON-SUCCESS\nPROMPT x\nEND\nEND\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot nest"), "{err}");
    }

    #[test]
    fn test_missing_end_rejected() {
        let err = parse("RUN /bin/false\nON-FAILURE\nPROMPT x\n").unwrap_err();
        assert!(err.to_string().contains("missing its END"), "{err}");
    }

    #[test]
    fn test_elide_before_block_rejected() {
        let err = parse("RUN /bin/false\nELIDE\nON-FAILURE\nPROMPT x\nEND\n").unwrap_err();
        assert!(err.to_string().contains("ELIDE"), "{err}");
    }

    #[test]
    fn test_elision_may_not_cross_block_boundary() {
        let err = parse("RUN /bin/false\nON-FAILURE\nPROMPT x\nELIDE\nEND\n").unwrap_err();
        assert!(err.to_string().contains("block boundary"), "{err}");
    }

    #[test]
    fn test_block_without_run_rejected() {
        assert!(parse("PROMPT hi\nON-FAILURE\nPROMPT x\nEND\n").is_err());
        assert!(parse("ADAPTER mock\nON-SUCCESS\nEND\nPROMPT x\n").is_err());
    }

    #[test]
    fn test_run_modifiers() {
        let wf = parse(
            "RUN cargo test\nRUN-CWD sub/dir\nRUN-ENV RUST_LOG=debug\nRUN-TIMEOUT 90\nRUN-OUTPUT always\nRUN-OUTPUT-LIMIT 4096\nRUN-ON-ERROR continue\n",
        )
        .unwrap();
        match &wf.steps[0] {
            Step::Run(run) => {
                assert_eq!(run.cwd.as_deref(), Some(Path::new("sub/dir")));
                assert_eq!(run.env.get("RUST_LOG").map(String::as_str), Some("debug"));
                assert_eq!(run.timeout, Duration::from_secs(90));
                assert_eq!(run.output_policy, OutputPolicy::Always);
                assert_eq!(run.output_limit, 4096);
                assert_eq!(run.on_error, OnError::Continue);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_run_retry_shorthand() {
        let wf = parse("RUN /bin/false\nRUN-RETRY 2 \"Fix the failing check.\"\n").unwrap();
        match &wf.steps[0] {
            Step::Run(run) => assert_eq!(
                run.on_error,
                OnError::Retry {
                    attempts: 2,
                    prompt: "Fix the failing check.".into()
                }
            ),
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_run_modifier_without_run_rejected() {
        assert!(parse("PROMPT hi\nRUN-TIMEOUT 5\n").is_err());
        assert!(parse("RUN-CWD /tmp\nPROMPT hi\n").is_err());
    }

    #[test]
    fn test_run_async_and_wait() {
        let wf = parse("RUN sleep 5\nRUN-ASYNC bg\nPROMPT hi\nRUN-WAIT bg\n").unwrap();
        match &wf.steps[0] {
            Step::Run(run) => {
                assert!(run.run_async);
                assert_eq!(run.handle.as_deref(), Some("bg"));
            }
            other => panic!("expected run, got {other:?}"),
        }
        assert!(matches!(&wf.steps[2], Step::RunWait { handle } if handle == "bg"));
    }

    #[test]
    fn test_continuation_body() {
        let wf = parse("ADAPTER mock\nPROMPT |\n  Review the change.\n  Fix style issues.\nRUN /bin/true\n")
            .unwrap();
        match &wf.steps[0] {
            Step::Prompt(p) => assert_eq!(p.text, "Review the change.\nFix style issues."),
            other => panic!("expected prompt, got {other:?}"),
        }
        assert_eq!(wf.steps.len(), 2);
    }

    #[test]
    fn test_unclosed_continuation_rejected() {
        let err = parse("PROMPT |\nRUN /bin/true\n").unwrap_err();
        assert!(err.to_string().contains("continuation"), "{err}");
    }

    #[test]
    fn test_verify_step() {
        let wf = parse("VERIFY refs docs/**/*.md\nVERIFY-ON-ERROR continue\nVERIFY-OUTPUT always\n").unwrap();
        match &wf.steps[0] {
            Step::Verify(v) => {
                assert_eq!(v.kind, "refs");
                assert_eq!(v.args, vec!["docs/**/*.md"]);
                assert_eq!(v.on_error, OnError::Continue);
                assert_eq!(v.output_policy, OutputPolicy::Always);
            }
            other => panic!("expected verify, got {other:?}"),
        }
    }

    #[test]
    fn test_session_steps() {
        let wf = parse(
            "ADAPTER mock\nPROMPT one\nCOMPACT prompts errors\nCHECKPOINT midpoint\nPAUSE \"waiting on review\"\nCONSULT \"Pick option A or B\"\nCONSULT-TIMEOUT 2h\nNEW-CONVERSATION\nPROMPT two\n",
        )
        .unwrap();
        assert!(matches!(&wf.steps[1], Step::Compact(c) if c.preserve.is_some()));
        assert!(matches!(&wf.steps[2], Step::Checkpoint { name } if name == "midpoint"));
        assert!(
            matches!(&wf.steps[3], Step::Pause { message: Some(m) } if m == "waiting on review")
        );
        match &wf.steps[4] {
            Step::Consult(c) => {
                assert_eq!(c.topic, "Pick option A or B");
                assert_eq!(c.timeout, Some(Duration::from_secs(2 * 3600)));
            }
            other => panic!("expected consult, got {other:?}"),
        }
        assert!(matches!(&wf.steps[5], Step::NewConversation));
    }

    #[test]
    fn test_consult_timeout_header_default() {
        let wf = parse("CONSULT-TIMEOUT 30m\nPROMPT x\nCONSULT \"topic\"\n").unwrap();
        match &wf.steps[1] {
            Step::Consult(c) => assert_eq!(c.timeout, Some(Duration::from_secs(1800))),
            other => panic!("expected consult, got {other:?}"),
        }
    }

    #[test]
    fn test_context_directives() {
        let wf = parse(
            "CONTEXT @src/**/*.rs\nCONTEXT-OPTIONAL @docs/*.md\nREQUIRE @Cargo.toml\nCONTEXT-EXCLUDE @src/generated.rs\nPROMPT go\nREFCAT @src/lib.rs#L1-L20\nPROMPT more\n",
        )
        .unwrap();
        assert_eq!(wf.required_context.len(), 3);
        assert!(wf.required_context[1].optional);
        assert!(!wf.required_context[2].inject);
        assert_eq!(wf.context_excludes.len(), 1);
        assert!(matches!(&wf.steps[1], Step::ContextInject { patterns } if patterns.len() == 1));
    }

    #[test]
    fn test_unknown_directive_becomes_custom_step() {
        let wf = parse("ADAPTER mock\nSPELLCHECK docs/ --fix\n").unwrap();
        match &wf.steps[0] {
            Step::Custom(c) => {
                assert_eq!(c.name, "SPELLCHECK");
                assert_eq!(c.args, "docs/ --fix");
            }
            other => panic!("expected custom, got {other:?}"),
        }
    }

    #[test]
    fn test_compaction_threshold_bounds() {
        assert!(parse("COMPACTION-MIN 0\nPROMPT x\n").is_err());
        assert!(parse("COMPACTION-MAX 101\nPROMPT x\n").is_err());
        let wf = parse("COMPACTION-THRESHOLD 70\nPROMPT x\n").unwrap();
        assert_eq!(wf.header.compaction.background, 70);
    }

    #[test]
    fn test_model_requirements() {
        let wf = parse("MODEL-REQUIRES context:200000 tier:premium\nMODEL-PREFERS speed:fast\nPROMPT x\n")
            .unwrap();
        let model = wf.header.model.unwrap();
        assert_eq!(model.requires.len(), 2);
        assert_eq!(model.prefers.len(), 1);
        assert!(model.id.is_none());
    }

    #[test]
    fn test_include_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.flow");
        let b = dir.path().join("b.flow");
        std::fs::write(&a, "INCLUDE b.flow\nPROMPT hi\n").unwrap();
        std::fs::write(&b, "INCLUDE a.flow\n").unwrap();
        let err = parse_file(&a).unwrap_err();
        assert!(err.to_string().contains("INCLUDE cycle"), "{err}");
    }

    #[test]
    fn test_include_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.flow");
        let shared = dir.path().join("shared.flow");
        std::fs::write(&main, "ADAPTER mock\nINCLUDE shared.flow\nPROMPT after\n").unwrap();
        std::fs::write(&shared, "PROMPT from include\n").unwrap();
        let wf = parse_file(&main).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert!(matches!(&wf.steps[0], Step::Prompt(p) if p.text == "from include"));
    }

    #[test]
    fn test_hash_stable_across_whitespace_outside_content() {
        let one = parse("ADAPTER mock\nPROMPT hi\n").unwrap();
        let two = parse("ADAPTER mock\nPROMPT hi\n").unwrap();
        assert_eq!(one.hash, two.hash);
        let three = parse("ADAPTER mock\nPROMPT hello\n").unwrap();
        assert_ne!(one.hash, three.hash);
    }
}
