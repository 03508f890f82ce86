//! Verification framework.
//!
//! A verifier scans the workspace and reports a structured result. The
//! built-in kinds cover reference resolution, link integrity, identifier
//! traceability, deprecated terminology, assertion presence and test
//! coverage; plugin-registered kinds run through the same contract.

pub mod assertions;
pub mod coverage;
pub mod links;
pub mod refs;
pub mod terminology;
pub mod traceability;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Structured verifier outcome, also the shape plugin handlers must print.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub output: String,
}

impl VerifyReport {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            output: output.into(),
        }
    }

    pub fn from_errors(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            passed: errors.is_empty(),
            output: String::new(),
            errors,
            warnings,
        }
    }
}

pub trait Verifier: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport>;
}

/// Registry of verifier kinds, seeded with the built-ins.
pub struct VerifierRegistry {
    verifiers: HashMap<&'static str, Box<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            verifiers: HashMap::new(),
        };
        registry.register(Box::new(refs::RefsVerifier));
        registry.register(Box::new(links::LinksVerifier));
        registry.register(Box::new(traceability::TraceabilityVerifier));
        registry.register(Box::new(terminology::TerminologyVerifier));
        registry.register(Box::new(assertions::AssertionsVerifier));
        registry.register(Box::new(coverage::CoverageVerifier));
        registry
    }

    pub fn register(&mut self, verifier: Box<dyn Verifier>) {
        self.verifiers.insert(verifier.kind(), verifier);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.verifiers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn run(&self, kind: &str, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        match self.verifiers.get(kind) {
            Some(verifier) => verifier.run(workspace, args),
            None => Err(Error::Validation(format!(
                "unknown verifier kind {kind:?} (available: {})",
                self.kinds().join(", ")
            ))),
        }
    }
}

/// Shared helper: files under the workspace matching the glob args, or a
/// default glob when none are given.
pub(crate) fn files_matching(
    workspace: &Path,
    args: &[String],
    default_glob: &str,
) -> Result<Vec<std::path::PathBuf>> {
    let globs: Vec<String> = if args.is_empty() {
        vec![default_glob.to_string()]
    } else {
        args.to_vec()
    };
    let mut files = Vec::new();
    for pattern in &globs {
        let spec = workspace.join(pattern).to_string_lossy().to_string();
        let walker =
            glob::glob(&spec).map_err(|e| Error::Validation(format!("bad glob {pattern:?}: {e}")))?;
        for entry in walker.filter_map(|e| e.ok()) {
            if entry.is_file() {
                files.push(entry);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtins() {
        let registry = VerifierRegistry::builtin();
        assert_eq!(
            registry.kinds(),
            vec![
                "assertions",
                "coverage",
                "links",
                "refs",
                "terminology",
                "traceability"
            ]
        );
    }

    #[test]
    fn test_unknown_kind() {
        let registry = VerifierRegistry::builtin();
        let err = registry
            .run("vibes", Path::new("."), &[])
            .unwrap_err();
        assert!(err.to_string().contains("unknown verifier"));
    }

    #[test]
    fn test_report_from_errors() {
        let failing = VerifyReport::from_errors(vec!["bad".into()], vec![]);
        assert!(!failing.passed);
        let passing = VerifyReport::from_errors(vec![], vec!["meh".into()]);
        assert!(passing.passed);
    }
}
