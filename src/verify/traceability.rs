//! `traceability`: identifiers must chain across artifacts.
//!
//! Identifiers matching the id pattern (default `[A-Z]{2,}-\d+`, override
//! with `--id-pattern REGEX` as the first args pair) are collected across
//! the scanned files; an id that appears in only one file is a broken
//! chain.

use super::{files_matching, VerifyReport, Verifier};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const DEFAULT_ID_PATTERN: &str = r"[A-Z]{2,}-\d+";

pub struct TraceabilityVerifier;

impl Verifier for TraceabilityVerifier {
    fn kind(&self) -> &'static str {
        "traceability"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        let mut args = args.to_vec();
        let mut id_pattern = DEFAULT_ID_PATTERN.to_string();
        if let Some(pos) = args.iter().position(|a| a == "--id-pattern") {
            if pos + 1 >= args.len() {
                return Err(Error::Validation("--id-pattern requires a regex".into()));
            }
            id_pattern = args.remove(pos + 1);
            args.remove(pos);
        }
        let id_re = Regex::new(&id_pattern)
            .map_err(|e| Error::Validation(format!("bad id pattern: {e}")))?;

        let mut occurrences: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
        for file in files_matching(workspace, &args, "**/*.md")? {
            let text = std::fs::read_to_string(&file)?;
            for m in id_re.find_iter(&text) {
                occurrences
                    .entry(m.as_str().to_string())
                    .or_default()
                    .insert(file.clone());
            }
        }

        let mut errors = Vec::new();
        for (id, files) in &occurrences {
            if files.len() < 2 {
                let only = files.iter().next().expect("non-empty occurrence set");
                errors.push(format!(
                    "{id} appears only in {}; nothing traces to it",
                    only.display()
                ));
            }
        }

        let mut report = VerifyReport::from_errors(errors, Vec::new());
        report.output = format!("traced {} identifier(s)", occurrences.len());
        Ok(report)
    }
}
