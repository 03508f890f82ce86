//! Reference resolution against the workspace.
//!
//! Resolution expands globs, applies line-range and pattern extraction,
//! filters exclusions, and de-duplicates by canonical path in insertion
//! order. Policy (strict vs lenient) is decided by the caller from the
//! returned miss list; `CONTEXT-OPTIONAL` misses only ever warn.

use super::{ContextRequirement, Extract, RefPattern};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One resolved file, possibly narrowed to a byte range by extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub contents: String,
    /// Byte range of `contents` within the full file, when extracted.
    pub byte_range: Option<(usize, usize)>,
}

/// The outcome of resolving a set of references.
#[derive(Debug, Clone, Default)]
pub struct ResolvedContext {
    pub files: Vec<ResolvedFile>,
    /// Patterns that matched nothing (or whose extraction matched nothing).
    pub misses: Vec<RefPattern>,
    pub warnings: Vec<String>,
}

impl ResolvedContext {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Resolves references relative to a workspace root, with optional named
/// alias roots from operator configuration.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    aliases: HashMap<String, PathBuf>,
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            aliases: HashMap::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, PathBuf>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an ordered list of references, applying exclusions and
    /// canonical-path deduplication.
    pub fn resolve(&self, patterns: &[RefPattern], excludes: &[RefPattern]) -> Result<ResolvedContext> {
        let excluded = self.excluded_paths(excludes)?;
        let mut out = ResolvedContext::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for pattern in patterns {
            let mut any = false;
            for path in self.matching_paths(pattern)? {
                let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                if excluded.contains(&canonical) {
                    continue;
                }
                match self.load(&path, pattern)? {
                    Some(file) => {
                        any = true;
                        if seen.insert(canonical) {
                            out.files.push(file);
                        }
                    }
                    // The file exists but the extraction matched nothing:
                    // the reference is a miss.
                    None => {}
                }
            }
            if !any {
                out.misses.push(pattern.clone());
            }
        }
        debug!(
            "resolved {} file(s), {} miss(es) from {} pattern(s)",
            out.files.len(),
            out.misses.len(),
            patterns.len()
        );
        Ok(out)
    }

    /// Resolve header-region requirements under a policy: strict misses on
    /// non-optional requirements are errors, everything else warns.
    pub fn resolve_requirements(
        &self,
        requirements: &[ContextRequirement],
        excludes: &[RefPattern],
        strict: bool,
    ) -> Result<ResolvedContext> {
        let injectable: Vec<RefPattern> = requirements
            .iter()
            .filter(|r| r.inject)
            .map(|r| r.pattern.clone())
            .collect();
        let mut resolved = self.resolve(&injectable, excludes)?;

        // REQUIRE patterns are existence checks only.
        for req in requirements.iter().filter(|r| !r.inject) {
            if self.matching_paths(&req.pattern)?.is_empty() {
                resolved.misses.push(req.pattern.clone());
            }
        }

        let optional: HashSet<&str> = requirements
            .iter()
            .filter(|r| r.optional)
            .map(|r| r.pattern.raw.as_str())
            .collect();
        for miss in &resolved.misses {
            if optional.contains(miss.raw.as_str()) {
                resolved
                    .warnings
                    .push(format!("optional context {miss} matched no files"));
            } else if strict {
                return Err(Error::MissingContext(miss.to_string()));
            } else {
                resolved
                    .warnings
                    .push(format!("context {miss} matched no files"));
            }
        }
        Ok(resolved)
    }

    fn base_for(&self, pattern: &RefPattern) -> Result<PathBuf> {
        match &pattern.alias {
            None => Ok(self.root.clone()),
            Some(alias) => self
                .aliases
                .get(alias)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("unknown workspace alias {alias:?}"))),
        }
    }

    fn matching_paths(&self, pattern: &RefPattern) -> Result<Vec<PathBuf>> {
        let base = self.base_for(pattern)?;
        let full = base.join(&pattern.pattern);

        if !pattern.is_glob() {
            return Ok(if full.is_file() { vec![full] } else { vec![] });
        }

        let spec = full.to_string_lossy().to_string();
        let walker = glob::glob(&spec)
            .map_err(|e| Error::Validation(format!("bad glob {:?}: {e}", pattern.raw)))?;
        let mut paths: Vec<PathBuf> = walker
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn excluded_paths(&self, excludes: &[RefPattern]) -> Result<HashSet<PathBuf>> {
        let mut set = HashSet::new();
        for pattern in excludes {
            for path in self.matching_paths(pattern)? {
                set.insert(path.canonicalize().unwrap_or(path));
            }
        }
        Ok(set)
    }

    /// Load one file and apply extraction. Returns `None` when the
    /// extraction matches nothing in the file.
    fn load(&self, path: &Path, pattern: &RefPattern) -> Result<Option<ResolvedFile>> {
        let contents = std::fs::read_to_string(path)?;
        match &pattern.extract {
            None => Ok(Some(ResolvedFile {
                path: path.to_path_buf(),
                contents,
                byte_range: None,
            })),
            Some(Extract::Lines { from, to }) => {
                let mut offset = 0usize;
                let mut start = None;
                let mut end = None;
                for (idx, line) in contents.split_inclusive('\n').enumerate() {
                    let line_no = idx + 1;
                    if line_no == *from {
                        start = Some(offset);
                    }
                    offset += line.len();
                    if line_no == *to {
                        end = Some(offset);
                        break;
                    }
                }
                match (start, end.or_else(|| start.map(|_| contents.len()))) {
                    (Some(s), Some(e)) => Ok(Some(ResolvedFile {
                        path: path.to_path_buf(),
                        contents: contents[s..e].to_string(),
                        byte_range: Some((s, e)),
                    })),
                    _ => Ok(None),
                }
            }
            Some(Extract::Pattern(pat)) => {
                let re = Regex::new(pat)
                    .map_err(|e| Error::Validation(format!("bad extraction regex: {e}")))?;
                match re.find(&contents) {
                    Some(m) => Ok(Some(ResolvedFile {
                        path: path.to_path_buf(),
                        contents: contents[m.start()..m.end()].to_string(),
                        byte_range: Some((m.start(), m.end())),
                    })),
                    None => Ok(None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        fs::write(dir.path().join("src/b.rs"), "line1\nline2\nline3\nline4\n").unwrap();
        fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();
        dir
    }

    fn pat(s: &str) -> RefPattern {
        RefPattern::parse(s).unwrap()
    }

    #[test]
    fn test_resolve_single_file() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let ctx = r.resolve(&[pat("@notes.md")], &[]).unwrap();
        assert_eq!(ctx.files.len(), 1);
        assert_eq!(ctx.files[0].contents, "# notes\n");
        assert!(ctx.misses.is_empty());
    }

    #[test]
    fn test_resolve_glob_dedup_and_order() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        // The second pattern re-matches a.rs; dedup keeps first occurrence.
        let ctx = r
            .resolve(&[pat("@src/*.rs"), pat("@src/a.rs")], &[])
            .unwrap();
        assert_eq!(ctx.files.len(), 2);
        assert!(ctx.files[0].path.ends_with("src/a.rs"));
        assert!(ctx.files[1].path.ends_with("src/b.rs"));
    }

    #[test]
    fn test_resolve_line_range() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let ctx = r.resolve(&[pat("@src/b.rs#L2-L3")], &[]).unwrap();
        assert_eq!(ctx.files[0].contents, "line2\nline3\n");
        assert!(ctx.files[0].byte_range.is_some());
    }

    #[test]
    fn test_resolve_regex_span() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let ctx = r.resolve(&[pat("@src/a.rs#/fn b\\(\\)/")], &[]).unwrap();
        assert_eq!(ctx.files[0].contents, "fn b()");
    }

    #[test]
    fn test_regex_miss_is_a_miss() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let ctx = r.resolve(&[pat("@src/a.rs#/fn zzz/")], &[]).unwrap();
        assert!(ctx.files.is_empty());
        assert_eq!(ctx.misses.len(), 1);
    }

    #[test]
    fn test_exclude_removes_matches() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let ctx = r
            .resolve(&[pat("@src/*.rs")], &[pat("@src/b.rs")])
            .unwrap();
        assert_eq!(ctx.files.len(), 1);
        assert!(ctx.files[0].path.ends_with("src/a.rs"));
    }

    #[test]
    fn test_strict_requirements_fail_on_miss() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let reqs = vec![ContextRequirement {
            pattern: pat("@missing/*.rs"),
            optional: false,
            inject: true,
        }];
        let err = r.resolve_requirements(&reqs, &[], true).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_optional_requirement_only_warns() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let reqs = vec![ContextRequirement {
            pattern: pat("@missing/*.rs"),
            optional: true,
            inject: true,
        }];
        let ctx = r.resolve_requirements(&reqs, &[], true).unwrap();
        assert_eq!(ctx.warnings.len(), 1);
    }

    #[test]
    fn test_require_checks_existence_without_injecting() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let reqs = vec![ContextRequirement {
            pattern: pat("@notes.md"),
            optional: false,
            inject: false,
        }];
        let ctx = r.resolve_requirements(&reqs, &[], true).unwrap();
        assert!(ctx.files.is_empty());
        assert!(ctx.misses.is_empty());
    }

    #[test]
    fn test_alias_scoping() {
        let ws = workspace();
        let mut aliases = HashMap::new();
        aliases.insert("srcroot".to_string(), ws.path().join("src"));
        let r = Resolver::new(ws.path()).with_aliases(aliases);
        let ctx = r.resolve(&[pat("@srcroot:a.rs")], &[]).unwrap();
        assert_eq!(ctx.files.len(), 1);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let ws = workspace();
        let r = Resolver::new(ws.path());
        let once = r.resolve(&[pat("@src/*.rs")], &[]).unwrap();
        let twice = r.resolve(&[pat("@src/*.rs")], &[]).unwrap();
        assert_eq!(once.files, twice.files);
    }
}
