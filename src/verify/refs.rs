//! `refs`: every `@`-reference in the scanned tree resolves to at least one
//! file.

use super::{files_matching, VerifyReport, Verifier};
use crate::context::{RefPattern, Resolver};
use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@[A-Za-z0-9_./*?\[\]-]+(?:#[^\s]+)?").expect("reference regex"));

pub struct RefsVerifier;

impl Verifier for RefsVerifier {
    fn kind(&self) -> &'static str {
        "refs"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        let resolver = Resolver::new(workspace);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut checked = 0usize;

        for file in files_matching(workspace, args, "**/*.md")? {
            let text = std::fs::read_to_string(&file)?;
            for (idx, line) in text.lines().enumerate() {
                for m in REFERENCE.find_iter(line) {
                    let token = m.as_str().trim_end_matches(['.', ',', ';', ')']);
                    let pattern = match RefPattern::parse(token) {
                        Ok(p) => p,
                        Err(e) => {
                            warnings.push(format!(
                                "{}:{}: unparseable reference {token}: {e}",
                                file.display(),
                                idx + 1
                            ));
                            continue;
                        }
                    };
                    checked += 1;
                    let resolved = resolver.resolve(std::slice::from_ref(&pattern), &[])?;
                    if resolved.is_empty() {
                        errors.push(format!(
                            "{}:{}: reference {pattern} resolves to no files",
                            file.display(),
                            idx + 1
                        ));
                    }
                }
            }
        }

        let mut report = VerifyReport::from_errors(errors, warnings);
        report.output = format!("checked {checked} reference(s)");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolving_and_dangling_refs() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("real.rs"), "fn main() {}\n").unwrap();
        std::fs::write(
            ws.path().join("doc.md"),
            "See @real.rs and also @missing/file.rs for details.\n",
        )
        .unwrap();

        let report = RefsVerifier.run(ws.path(), &[]).unwrap();
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("missing/file.rs"));
        assert!(report.output.contains("checked 2"));
    }

    #[test]
    fn test_clean_tree_passes() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.rs"), "").unwrap();
        std::fs::write(ws.path().join("doc.md"), "Only @a.rs here.\n").unwrap();
        let report = RefsVerifier.run(ws.path(), &[]).unwrap();
        assert!(report.passed);
    }
}
