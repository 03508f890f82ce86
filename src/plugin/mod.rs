//! Workspace plugin directives.
//!
//! A workspace ships `.sdqctl/directives.yaml` declaring custom directive
//! kinds: a handler command plus the capabilities it requests. The
//! manifest is loaded once at engine start; unknown directives that match
//! an entry dispatch to the handler, which receives a JSON payload on
//! stdin and prints a verifier-shaped JSON result. Capability enforcement
//! is path-restricted: handlers only see the declared workspace roots.

use crate::error::{Error, Result};
use crate::subprocess::{ProcessCommand, ProcessRunner};
use crate::verify::VerifyReport;
use crate::workflow::Mode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MANIFEST_DIR: &str = ".sdqctl";
pub const MANIFEST_FILE: &str = "directives.yaml";
pub const MANIFEST_VERSION: u32 = 1;
pub const WORKSPACE_ROOTS_ENV: &str = "SDQCTL_WORKSPACE_ROOTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ReadFiles,
    WriteFiles,
    RunCommands,
    Network,
}

/// One declared directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveSpec {
    /// Command line to invoke; the directive payload arrives on stdin.
    pub handler: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub version: u32,
    #[serde(default)]
    pub directives: BTreeMap<String, DirectiveSpec>,
}

impl PluginManifest {
    /// Load the workspace manifest if present. Directive keys are
    /// canonicalized to uppercase to match parsed directive names.
    pub fn load(workspace: &Path) -> Result<Option<PluginManifest>> {
        let path = workspace.join(MANIFEST_DIR).join(MANIFEST_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut manifest: PluginManifest = serde_yaml::from_str(&text)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Plugin(format!(
                "manifest {} is version {}, this build supports {MANIFEST_VERSION}",
                path.display(),
                manifest.version
            )));
        }
        manifest.directives = manifest
            .directives
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        debug!(
            "loaded plugin manifest with {} directive(s)",
            manifest.directives.len()
        );
        Ok(Some(manifest))
    }
}

/// Payload handed to a handler on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectivePayload {
    pub directive: String,
    pub args: String,
    pub workspace: PathBuf,
    pub cycle: u32,
    pub step_index: usize,
}

/// The loaded registry, constructed once at engine start.
pub struct PluginRegistry {
    workspace: PathBuf,
    manifest: Option<PluginManifest>,
    runner: Arc<dyn ProcessRunner>,
}

impl PluginRegistry {
    pub fn load(workspace: &Path, runner: Arc<dyn ProcessRunner>) -> Result<Self> {
        Ok(Self {
            workspace: workspace.to_path_buf(),
            manifest: PluginManifest::load(workspace)?,
            runner,
        })
    }

    pub fn empty(workspace: &Path, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            manifest: None,
            runner,
        }
    }

    pub fn directives(&self) -> Vec<(&str, &DirectiveSpec)> {
        self.manifest
            .as_ref()
            .map(|m| {
                m.directives
                    .iter()
                    .map(|(k, v)| (k.as_str(), v))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn knows(&self, directive: &str) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.directives.contains_key(directive))
    }

    /// Capability gate: read-only workflows refuse handlers that ask for
    /// write or exec rights.
    fn check_capabilities(&self, directive: &str, spec: &DirectiveSpec, mode: Mode) -> Result<()> {
        if mode == Mode::ReadOnly || mode == Mode::Audit {
            for denied in [Capability::WriteFiles, Capability::RunCommands] {
                if spec.capabilities.contains(&denied) {
                    return Err(Error::CapabilityDenied(format!(
                        "directive {directive} requests {denied:?}, not allowed in {mode:?} mode"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Dispatch a custom directive to its handler.
    pub async fn dispatch(
        &self,
        directive: &str,
        args: &str,
        mode: Mode,
        cycle: u32,
        step_index: usize,
    ) -> Result<VerifyReport> {
        let spec = self
            .manifest
            .as_ref()
            .and_then(|m| m.directives.get(directive))
            .ok_or_else(|| {
                Error::Plugin(format!("no handler registered for directive {directive}"))
            })?;
        self.check_capabilities(directive, spec, mode)?;

        let payload = DirectivePayload {
            directive: directive.to_string(),
            args: args.to_string(),
            workspace: self.workspace.clone(),
            cycle,
            step_index,
        };

        let mut command = ProcessCommand::from_command_line(&spec.handler, false)
            .map_err(|e| Error::Plugin(format!("bad handler for {directive}: {e}")))?;
        command.working_dir = Some(self.workspace.clone());
        command.stdin = Some(serde_json::to_string(&payload)?);
        command.env.insert(
            WORKSPACE_ROOTS_ENV.to_string(),
            self.workspace.display().to_string(),
        );

        let output = self
            .runner
            .run(command)
            .await
            .map_err(|e| Error::Plugin(format!("handler for {directive} failed: {e}")))?;

        // A handler that prints a structured report wins; otherwise fall
        // back to exit status + raw output.
        match serde_json::from_str::<VerifyReport>(&output.stdout) {
            Ok(report) => Ok(report),
            Err(_) => {
                if !output.success() {
                    warn!(
                        "handler for {directive} exited nonzero without a structured report"
                    );
                }
                Ok(VerifyReport {
                    passed: output.success(),
                    errors: if output.success() {
                        vec![]
                    } else {
                        vec![output.stderr.clone()]
                    },
                    warnings: vec![],
                    output: output.stdout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::mock::MockProcessResult;
    use crate::subprocess::MockProcessRunner;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, body: &str) {
        let plugin_dir = dir.join(MANIFEST_DIR);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let ws = TempDir::new().unwrap();
        assert!(PluginManifest::load(ws.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_manifest() {
        let ws = TempDir::new().unwrap();
        write_manifest(
            ws.path(),
            "version: 1\ndirectives:\n  spellcheck:\n    handler: spell --json\n    capabilities: [read-files]\n    description: spell check docs\n",
        );
        let manifest = PluginManifest::load(ws.path()).unwrap().unwrap();
        assert!(manifest.directives.contains_key("SPELLCHECK"));
        let spec = &manifest.directives["SPELLCHECK"];
        assert!(spec.capabilities.contains(&Capability::ReadFiles));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let ws = TempDir::new().unwrap();
        write_manifest(ws.path(), "version: 9\ndirectives: {}\n");
        assert!(matches!(
            PluginManifest::load(ws.path()).unwrap_err(),
            Error::Plugin(_)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_structured_report() {
        let ws = TempDir::new().unwrap();
        write_manifest(
            ws.path(),
            "version: 1\ndirectives:\n  SPELLCHECK:\n    handler: spell\n",
        );
        let runner = Arc::new(MockProcessRunner::with_script([MockProcessResult::ok(
            r#"{"passed": false, "errors": ["typo in README"], "warnings": [], "output": "1 issue"}"#,
        )]));
        let registry = PluginRegistry::load(ws.path(), runner).unwrap();
        let report = registry
            .dispatch("SPELLCHECK", "docs/", Mode::Full, 1, 0)
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.errors, vec!["typo in README"]);
    }

    #[tokio::test]
    async fn test_capability_denied_in_read_only() {
        let ws = TempDir::new().unwrap();
        write_manifest(
            ws.path(),
            "version: 1\ndirectives:\n  FIXER:\n    handler: fixer\n    capabilities: [write-files]\n",
        );
        let runner = Arc::new(MockProcessRunner::default());
        let registry = PluginRegistry::load(ws.path(), runner).unwrap();
        let err = registry
            .dispatch("FIXER", "", Mode::ReadOnly, 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityDenied(_)));
    }

    #[tokio::test]
    async fn test_unknown_directive() {
        let ws = TempDir::new().unwrap();
        let runner = Arc::new(MockProcessRunner::default());
        let registry = PluginRegistry::empty(ws.path(), runner);
        assert!(!registry.knows("SPELLCHECK"));
        assert!(registry
            .dispatch("SPELLCHECK", "", Mode::Full, 1, 0)
            .await
            .is_err());
    }
}
