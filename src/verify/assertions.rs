//! `assertions`: files must contain a required pattern.
//!
//! `VERIFY assertions <glob> <regex>` checks that every file matching the
//! glob contains at least one match of the regex.

use super::{files_matching, VerifyReport, Verifier};
use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;

pub struct AssertionsVerifier;

impl Verifier for AssertionsVerifier {
    fn kind(&self) -> &'static str {
        "assertions"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        if args.len() < 2 {
            return Err(Error::Validation(
                "assertions requires a glob and a pattern".into(),
            ));
        }
        let glob_args = vec![args[0].clone()];
        let pattern = Regex::new(&args[1])
            .map_err(|e| Error::Validation(format!("bad assertion pattern: {e}")))?;

        let files = files_matching(workspace, &glob_args, "**/*")?;
        if files.is_empty() {
            return Ok(VerifyReport {
                passed: true,
                warnings: vec![format!("assertion glob {} matched no files", args[0])],
                ..VerifyReport::default()
            });
        }

        let mut errors = Vec::new();
        for file in &files {
            let text = std::fs::read_to_string(file)?;
            if !pattern.is_match(&text) {
                errors.push(format!(
                    "{} contains no match for {:?}",
                    file.display(),
                    args[1]
                ));
            }
        }

        let mut report = VerifyReport::from_errors(errors, Vec::new());
        report.output = format!("asserted {:?} across {} file(s)", args[1], files.len());
        Ok(report)
    }
}
