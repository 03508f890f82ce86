//! Command routing.
//!
//! Each subcommand builds its inputs from operator config + flags and
//! delegates to the library; nothing below this layer reads the CLI.

use super::args::{Cli, Commands, ExecArgs, PluginCommands, SessionsCommands};
use crate::adapter::create_adapter;
use crate::config::OperatorConfig;
use crate::context::RefPattern;
use crate::engine::{resume, validate_workflow, Engine, EngineOptions};
use crate::error::{Error, Result};
use crate::plugin::{PluginManifest, PluginRegistry, MANIFEST_VERSION};
use crate::render::RenderedDocument;
use crate::session::store::SESSION_DIR_ENV;
use crate::session::SessionStore;
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::template::Variables;
use crate::verify::VerifierRegistry;
use crate::workflow::{parse_file, CycleLimit, Step, ValidationMode, Workflow};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { workflow, exec } => execute_workflow(&workflow, Some(1), exec).await,
        Commands::Iterate {
            workflow,
            cycles,
            exec,
        } => execute_workflow(&workflow, cycles, exec).await,
        Commands::Validate {
            workflow,
            path,
            strict,
            allow_missing,
            exclude,
        } => cmd_validate(&workflow, path, strict, allow_missing, &exclude),
        Commands::Render { workflow, json } => cmd_render(&workflow, json),
        Commands::Show { workflow } => cmd_show(&workflow),
        Commands::Sessions { command } => cmd_sessions(command).await,
        Commands::Verify { kind, args, path } => cmd_verify(&kind, &args, path),
        Commands::Status {
            adapter,
            models,
            auth,
            all,
        } => cmd_status(adapter, models, auth, all).await,
        Commands::Plugin { command } => cmd_plugin(command),
    }
}

/// Session store precedence: environment, then operator config, then the
/// home-directory default.
fn session_store(operator: &OperatorConfig) -> Result<SessionStore> {
    if std::env::var(SESSION_DIR_ENV).is_ok() {
        return SessionStore::from_env();
    }
    match &operator.session_dir {
        Some(dir) => Ok(SessionStore::new(dir.clone())),
        None => SessionStore::from_env(),
    }
}

fn load_workflow(path: &Path, exec: &ExecArgs) -> Result<Workflow> {
    match &exec.from_json {
        Some(source) => {
            let text = if source == "-" {
                let mut text = String::new();
                std::io::stdin().read_to_string(&mut text)?;
                text
            } else {
                std::fs::read_to_string(source)?
            };
            Ok(RenderedDocument::from_json(&text)?.workflow)
        }
        None => parse_file(path),
    }
}

fn build_vars(exec: &ExecArgs) -> Result<Variables> {
    let mut vars = Variables::new();
    vars.add_cli_pairs(exec.vars.iter().map(String::as_str))?;
    if exec.vars_stdin && exec.from_json.as_deref() != Some("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        vars.add_json_object(&value)?;
    }
    Ok(vars)
}

async fn execute_workflow(path: &Path, cycles: Option<u32>, exec: ExecArgs) -> Result<()> {
    let operator = OperatorConfig::load()?;
    let workflow = load_workflow(path, &exec)?;
    let vars = build_vars(&exec)?;

    let max_cycles = cycles
        .or(exec.max_cycles)
        .map(CycleLimit::Bounded);
    let mode = exec
        .mode
        .as_deref()
        .map(|m| m.parse().map_err(Error::Validation))
        .transpose()?;
    let validation = if exec.strict {
        Some(ValidationMode::Strict)
    } else if exec.lenient {
        Some(ValidationMode::Lenient)
    } else {
        None
    };
    let infinite_sessions = if exec.no_infinite_sessions {
        Some(false)
    } else if exec.compact {
        Some(true)
    } else {
        None
    };

    let options = EngineOptions {
        workspace: exec.path.clone(),
        max_cycles,
        session_name: exec.session_name.clone(),
        adapter: exec.adapter.clone().or(operator.default_adapter.clone()),
        model: exec.model.clone(),
        default_model: operator.default_model.clone(),
        mode,
        validation,
        compaction_min: exec.compaction_min,
        compaction_threshold: exec.compaction_threshold,
        compaction_max: exec.compaction_max,
        infinite_sessions,
        allow_shell: exec.allow_shell,
        prologues: exec.prologue.clone(),
        vars,
        aliases: operator.workspace_aliases.clone(),
        store: Some(session_store(&operator)?),
    };

    let engine = Engine::new(workflow.clone(), options).await?;
    let cancel = engine.cancellation_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = engine.run().await?;
    if exec.json {
        let document = RenderedDocument::trace(&workflow, report.trace);
        println!("{}", document.to_json()?);
    } else {
        for warning in &report.warnings {
            eprintln!("warning: {warning}");
        }
        println!(
            "session {} completed {} cycle(s)",
            report.session_id, report.cycles_completed
        );
    }
    Ok(())
}

fn cmd_validate(
    path: &Path,
    workspace: Option<PathBuf>,
    strict: bool,
    allow_missing: bool,
    exclude: &[String],
) -> Result<()> {
    let workflow = parse_file(path)?;
    let workspace = workspace.unwrap_or_else(|| PathBuf::from("."));
    let excludes = exclude
        .iter()
        .map(|g| RefPattern::parse(g))
        .collect::<Result<Vec<_>>>()?;
    let strict_override = strict.then_some(true);
    let warnings = validate_workflow(&workflow, &workspace, strict_override, allow_missing, &excludes)?;
    for warning in &warnings {
        eprintln!("warning: {warning}");
    }
    println!(
        "{}: {} step(s), {} warning(s)",
        path.display(),
        workflow.steps.len(),
        warnings.len()
    );
    Ok(())
}

fn cmd_render(path: &Path, compact: bool) -> Result<()> {
    let workflow = parse_file(path)?;
    let document = RenderedDocument::plan(&workflow)?;
    if compact {
        println!("{}", serde_json::to_string(&document)?);
    } else {
        println!("{}", document.to_json()?);
    }
    Ok(())
}

fn cmd_show(path: &Path) -> Result<()> {
    let workflow = parse_file(path)?;
    println!("workflow: {}", path.display());
    println!("hash: {}", workflow.hash);
    if let Some(adapter) = &workflow.header.adapter {
        println!("adapter: {adapter}");
    }
    if let Some(model) = &workflow.header.model {
        match &model.id {
            Some(id) => println!("model: {id}"),
            None => println!(
                "model requirements: {}",
                model
                    .requires
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
        }
    }
    println!("max cycles: {:?}", workflow.header.max_cycles);
    println!("mode: {:?}", workflow.header.mode);
    for help in &workflow.header.help {
        println!("help: {help}");
    }
    if !workflow.required_context.is_empty() {
        println!("context:");
        for requirement in &workflow.required_context {
            let marker = if requirement.optional {
                " (optional)"
            } else if !requirement.inject {
                " (require only)"
            } else {
                ""
            };
            println!("  {}{marker}", requirement.pattern);
        }
    }
    println!("steps:");
    for (index, step) in workflow.steps.iter().enumerate() {
        print_step(index, step, 1);
    }
    Ok(())
}

fn print_step(index: usize, step: &Step, depth: usize) {
    let pad = "  ".repeat(depth);
    match step {
        Step::Prompt(p) => {
            let first = p.text.lines().next().unwrap_or("");
            let elide = if p.elide_into_next { " [elide]" } else { "" };
            println!("{pad}{index}: prompt {first:?}{elide}");
        }
        Step::Run(r) => {
            let elide = if r.elide_into_next { " [elide]" } else { "" };
            let asyncness = if r.run_async { " [async]" } else { "" };
            println!("{pad}{index}: run {:?}{elide}{asyncness}", r.command);
            if !r.success_block.is_empty() {
                println!("{pad}  on-success:");
                for (i, inner) in r.success_block.iter().enumerate() {
                    print_step(i, inner, depth + 2);
                }
            }
            if !r.failure_block.is_empty() {
                println!("{pad}  on-failure:");
                for (i, inner) in r.failure_block.iter().enumerate() {
                    print_step(i, inner, depth + 2);
                }
            }
        }
        other => println!("{pad}{index}: {}", other.kind()),
    }
}

async fn cmd_sessions(command: SessionsCommands) -> Result<()> {
    let operator = OperatorConfig::load()?;
    let store = session_store(&operator)?;
    match command {
        SessionsCommands::List => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("no stored sessions under {}", store.root().display());
                return Ok(());
            }
            for session in sessions {
                let status = session
                    .checkpoint
                    .as_ref()
                    .map(|c| format!("{:?}", c.status).to_lowercase())
                    .unwrap_or_else(|| "no checkpoint".to_string());
                let modified = session
                    .modified_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  {status}  {modified}", session.id);
            }
            Ok(())
        }
        SessionsCommands::Show { session_id } => {
            let session = store.load_existing(&session_id)?;
            match &session.checkpoint {
                Some(checkpoint) => {
                    println!("{}", serde_json::to_string_pretty(checkpoint)?)
                }
                None => println!("no checkpoint"),
            }
            if let Some(metrics) = &session.metrics {
                println!("{}", serde_json::to_string_pretty(metrics)?);
            }
            Ok(())
        }
        SessionsCommands::Delete { session_id } => {
            store.delete(&session_id)?;
            println!("deleted {session_id}");
            Ok(())
        }
        SessionsCommands::Cleanup { older_than, dry_run } => {
            let age = humantime::parse_duration(&older_than)
                .map_err(|e| Error::Validation(format!("bad --older-than: {e}")))?;
            let removed = store.cleanup(age, dry_run)?;
            let verb = if dry_run { "would remove" } else { "removed" };
            println!("{verb} {} session(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
            Ok(())
        }
        SessionsCommands::Resume { session_id, prompt } => {
            let options = EngineOptions {
                store: Some(store),
                aliases: operator.workspace_aliases.clone(),
                ..EngineOptions::default()
            };
            let report = resume::resume_session(&session_id, options, prompt).await?;
            println!(
                "session {} completed {} cycle(s)",
                report.session_id, report.cycles_completed
            );
            Ok(())
        }
    }
}

fn cmd_verify(kind: &str, args: &[String], path: Option<PathBuf>) -> Result<()> {
    let workspace = path.unwrap_or_else(|| PathBuf::from("."));
    let registry = VerifierRegistry::builtin();
    let report = registry.run(kind, &workspace, args)?;
    if !report.output.is_empty() {
        println!("{}", report.output);
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    if report.passed {
        println!("verify {kind}: passed");
        Ok(())
    } else {
        Err(Error::VerifyFailure {
            kind: kind.to_string(),
            errors: report.errors.len(),
        })
    }
}

async fn cmd_status(
    adapter_name: Option<String>,
    models: bool,
    auth: bool,
    all: bool,
) -> Result<()> {
    let operator = OperatorConfig::load()?;
    let name = adapter_name
        .or(operator.default_adapter)
        .unwrap_or_else(|| "mock".to_string());
    let adapter = create_adapter(&name)?;
    adapter.start().await?;

    let status = adapter.status().await?;
    println!(
        "adapter {}: {}{}",
        status.name,
        if status.available { "available" } else { "unavailable" },
        status
            .version
            .map(|v| format!(" ({v})"))
            .unwrap_or_default()
    );
    if auth || all {
        let auth_status = adapter.auth_status().await?;
        println!(
            "auth: {}{}",
            if auth_status.authenticated {
                "authenticated"
            } else {
                "not authenticated"
            },
            auth_status
                .account
                .map(|a| format!(" as {a}"))
                .unwrap_or_default()
        );
    }
    if models || all {
        for model in adapter.list_models().await? {
            println!(
                "model {}: {} tokens, {:?}/{:?}, {}/{}",
                model.id,
                model.context_tokens,
                model.tier,
                model.speed,
                model.vendor,
                model.family
            );
        }
    }
    Ok(())
}

fn cmd_plugin(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { path } => {
            let workspace = path.unwrap_or_else(|| PathBuf::from("."));
            let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
            let registry = PluginRegistry::load(&workspace, runner)?;
            let directives = registry.directives();
            if directives.is_empty() {
                println!("no plugin directives declared");
                return Ok(());
            }
            for (name, spec) in directives {
                let capabilities = spec
                    .capabilities
                    .iter()
                    .map(|c| format!("{c:?}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{name}: {} [{capabilities}]", spec.description);
            }
            Ok(())
        }
        PluginCommands::Validate { path } => {
            let text = std::fs::read_to_string(&path)?;
            let manifest: PluginManifest = serde_yaml::from_str(&text)?;
            if manifest.version != MANIFEST_VERSION {
                return Err(Error::Plugin(format!(
                    "manifest version {} is not supported (expected {MANIFEST_VERSION})",
                    manifest.version
                )));
            }
            println!(
                "{}: {} directive(s), version {}",
                path.display(),
                manifest.directives.len(),
                manifest.version
            );
            Ok(())
        }
    }
}
