//! `links`: URLs parse and local link targets exist.

use super::{files_matching, VerifyReport, Verifier};
use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use url::Url;

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]\(([^)\s]+)\)").expect("markdown link regex"));

pub struct LinksVerifier;

impl Verifier for LinksVerifier {
    fn kind(&self) -> &'static str {
        "links"
    }

    fn run(&self, workspace: &Path, args: &[String]) -> Result<VerifyReport> {
        let mut errors = Vec::new();
        let mut checked = 0usize;

        for file in files_matching(workspace, args, "**/*.md")? {
            let text = std::fs::read_to_string(&file)?;
            for (idx, line) in text.lines().enumerate() {
                for caps in MARKDOWN_LINK.captures_iter(line) {
                    let target = &caps[1];
                    checked += 1;
                    if target.starts_with("http://") || target.starts_with("https://") {
                        if Url::parse(target).is_err() {
                            errors.push(format!(
                                "{}:{}: malformed URL {target}",
                                file.display(),
                                idx + 1
                            ));
                        }
                        continue;
                    }
                    if target.starts_with('#') || target.starts_with("mailto:") {
                        continue;
                    }
                    // Local link, relative to the containing file; drop any
                    // fragment before checking.
                    let path_part = target.split('#').next().unwrap_or(target);
                    let base = file.parent().unwrap_or(workspace);
                    if !base.join(path_part).exists() {
                        errors.push(format!(
                            "{}:{}: broken local link {target}",
                            file.display(),
                            idx + 1
                        ));
                    }
                }
            }
        }

        let mut report = VerifyReport::from_errors(errors, Vec::new());
        report.output = format!("checked {checked} link(s)");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_broken_and_valid_links() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("exists.md"), "# here\n").unwrap();
        std::fs::write(
            ws.path().join("index.md"),
            "[good](exists.md) [bad](gone.md) [url](https://example.com/x) [anchor](#top)\n",
        )
        .unwrap();

        let report = LinksVerifier.run(ws.path(), &[]).unwrap();
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("gone.md"));
    }

    #[test]
    fn test_fragment_on_local_link() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("target.md"), "# t\n").unwrap();
        std::fs::write(ws.path().join("index.md"), "[x](target.md#section)\n").unwrap();
        let report = LinksVerifier.run(ws.path(), &[]).unwrap();
        assert!(report.passed, "{:?}", report.errors);
    }
}
