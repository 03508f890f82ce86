//! `terminology`: scan for deprecated terms.
//!
//! Args are `term` or `term=replacement` pairs; any occurrence of a term is
//! an error, with the replacement suggested when given.

use super::{files_matching, VerifyReport, Verifier};
use crate::error::{Error, Result};
use std::path::Path;

pub struct TerminologyVerifier;

impl Verifier for TerminologyVerifier {
    fn kind(&self) -> &'static str {
        "terminology"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        let (terms, globs): (Vec<&String>, Vec<&String>) =
            args.iter().partition(|a| !a.contains(['*', '/']) || a.contains('='));
        if terms.is_empty() {
            return Err(Error::Validation(
                "terminology requires at least one deprecated term".into(),
            ));
        }
        let globs: Vec<String> = globs.into_iter().cloned().collect();

        let mut errors = Vec::new();
        for file in files_matching(workspace, &globs, "**/*.md")? {
            let text = std::fs::read_to_string(&file)?;
            for (idx, line) in text.lines().enumerate() {
                for term in &terms {
                    let (needle, replacement) = match term.split_once('=') {
                        Some((t, r)) => (t, Some(r)),
                        None => (term.as_str(), None),
                    };
                    if line.to_lowercase().contains(&needle.to_lowercase()) {
                        let suggestion = replacement
                            .map(|r| format!(" (use {r:?})"))
                            .unwrap_or_default();
                        errors.push(format!(
                            "{}:{}: deprecated term {needle:?}{suggestion}",
                            file.display(),
                            idx + 1
                        ));
                    }
                }
            }
        }

        let mut report = VerifyReport::from_errors(errors, Vec::new());
        report.output = format!("scanned for {} term(s)", terms.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deprecated_term_found() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("doc.md"), "Check the whitelist first.\n").unwrap();
        let args = vec!["whitelist=allowlist".to_string()];
        let report = TerminologyVerifier.run(ws.path(), &args).unwrap();
        assert!(!report.passed);
        assert!(report.errors[0].contains("allowlist"));
    }

    #[test]
    fn test_requires_terms() {
        let ws = TempDir::new().unwrap();
        assert!(TerminologyVerifier.run(ws.path(), &[]).is_err());
    }

    #[test]
    fn test_clean_tree() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("doc.md"), "All good here.\n").unwrap();
        let args = vec!["whitelist".to_string()];
        let report = TerminologyVerifier.run(ws.path(), &args).unwrap();
        assert!(report.passed);
    }
}
