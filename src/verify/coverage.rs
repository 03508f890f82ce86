//! `coverage`: every source file is referenced from the test tree.
//!
//! `VERIFY coverage <src-glob> <test-glob>` reports source files whose stem
//! never appears in any test file.

use super::{files_matching, VerifyReport, Verifier};
use crate::error::{Error, Result};
use std::path::Path;

pub struct CoverageVerifier;

impl Verifier for CoverageVerifier {
    fn kind(&self) -> &'static str {
        "coverage"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        if args.len() < 2 {
            return Err(Error::Validation(
                "coverage requires a source glob and a test glob".into(),
            ));
        }
        let sources = files_matching(workspace, &args[..1].to_vec(), "src/**/*.rs")?;
        let tests = files_matching(workspace, &args[1..2].to_vec(), "tests/**/*.rs")?;

        let mut corpus = String::new();
        for file in &tests {
            corpus.push_str(&std::fs::read_to_string(file)?);
            corpus.push('\n');
        }

        let mut errors = Vec::new();
        for source in &sources {
            let stem = match source.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if stem != "mod" && stem != "lib" && stem != "main" => stem,
                _ => continue,
            };
            if !corpus.contains(stem) {
                errors.push(format!(
                    "{} is never referenced from the test tree",
                    source.display()
                ));
            }
        }

        let mut report = VerifyReport::from_errors(errors, Vec::new());
        report.output = format!(
            "checked {} source file(s) against {} test file(s)",
            sources.len(),
            tests.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unreferenced_source_fails() {
        let ws = TempDir::new().unwrap();
        std::fs::create_dir_all(ws.path().join("src")).unwrap();
        std::fs::create_dir_all(ws.path().join("tests")).unwrap();
        std::fs::write(ws.path().join("src/parser.rs"), "").unwrap();
        std::fs::write(ws.path().join("src/orphan.rs"), "").unwrap();
        std::fs::write(ws.path().join("tests/it.rs"), "use crate::parser;\n").unwrap();

        let args = vec!["src/**/*.rs".to_string(), "tests/**/*.rs".to_string()];
        let report = CoverageVerifier.run(ws.path(), &args).unwrap();
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("orphan.rs"));
    }

    #[test]
    fn test_mod_and_lib_skipped() {
        let ws = TempDir::new().unwrap();
        std::fs::create_dir_all(ws.path().join("src")).unwrap();
        std::fs::create_dir_all(ws.path().join("tests")).unwrap();
        std::fs::write(ws.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(ws.path().join("src/mod.rs"), "").unwrap();
        std::fs::write(ws.path().join("tests/it.rs"), "").unwrap();

        let args = vec!["src/**/*.rs".to_string(), "tests/**/*.rs".to_string()];
        let report = CoverageVerifier.run(ws.path(), &args).unwrap();
        assert!(report.passed);
    }
}
