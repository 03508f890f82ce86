//! Context reference grammar and resolution.
//!
//! References name workspace files to inject into prompts: `@pattern`,
//! `@pattern#Lfrom-Lto` for line ranges, `@pattern#/regex/` for
//! pattern-extracted spans, and `alias:pattern` to scope the lookup to a
//! named workspace root. Globs support `*`, `?` and recursive `**`.

pub mod resolver;

pub use resolver::{ResolvedContext, Resolver};

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Extraction applied to a resolved file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extract {
    /// Inclusive 1-based line range.
    Lines { from: usize, to: usize },
    /// Contiguous span matched by a regex.
    Pattern(String),
}

/// A parsed file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefPattern {
    /// Original token as authored, for diagnostics.
    pub raw: String,
    /// Workspace-root alias, if scoped.
    pub alias: Option<String>,
    /// Path or glob, stripped of `@`, alias and extraction suffix.
    pub pattern: String,
    pub extract: Option<Extract>,
}

static LINE_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^L(\d+)-L?(\d+)$").expect("line range regex"));
static ALIAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*):(.+)$").expect("alias regex"));

impl RefPattern {
    /// Parse a reference token. A leading `@` is accepted and stripped.
    pub fn parse(token: &str) -> Result<Self> {
        let raw = token.to_string();
        let body = token.strip_prefix('@').unwrap_or(token);
        if body.is_empty() {
            return Err(Error::Validation(format!("empty reference: {raw:?}")));
        }

        let (body, extract) = match body.split_once('#') {
            Some((head, suffix)) => (head, Some(Self::parse_extract(suffix, &raw)?)),
            None => (body, None),
        };

        let (alias, pattern) = match ALIAS.captures(body) {
            // Single-letter prefixes are left alone so Windows-style drive
            // paths never parse as aliases.
            Some(caps) if caps[1].len() > 1 => {
                (Some(caps[1].to_string()), caps[2].to_string())
            }
            _ => (None, body.to_string()),
        };

        if pattern.is_empty() {
            return Err(Error::Validation(format!("empty pattern in reference {raw:?}")));
        }

        Ok(RefPattern {
            raw,
            alias,
            pattern,
            extract,
        })
    }

    fn parse_extract(suffix: &str, raw: &str) -> Result<Extract> {
        if let Some(caps) = LINE_RANGE.captures(suffix) {
            let from: usize = caps[1].parse().map_err(|_| {
                Error::Validation(format!("bad line range in {raw:?}"))
            })?;
            let to: usize = caps[2].parse().map_err(|_| {
                Error::Validation(format!("bad line range in {raw:?}"))
            })?;
            if from == 0 || to < from {
                return Err(Error::Validation(format!(
                    "line range must be 1-based and ordered in {raw:?}"
                )));
            }
            return Ok(Extract::Lines { from, to });
        }
        if let Some(pat) = suffix.strip_prefix('/').and_then(|s| s.strip_suffix('/')) {
            Regex::new(pat)
                .map_err(|e| Error::Validation(format!("bad extraction regex in {raw:?}: {e}")))?;
            return Ok(Extract::Pattern(pat.to_string()));
        }
        Err(Error::Validation(format!(
            "unrecognized extraction suffix {suffix:?} in {raw:?} (expected #Lfrom-Lto or #/regex/)"
        )))
    }

    /// Whether the pattern contains glob metacharacters.
    pub fn is_glob(&self) -> bool {
        self.pattern.contains(['*', '?', '['])
    }
}

impl std::fmt::Display for RefPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@")?;
        if let Some(alias) = &self.alias {
            write!(f, "{alias}:")?;
        }
        write!(f, "{}", self.pattern)?;
        match &self.extract {
            Some(Extract::Lines { from, to }) => write!(f, "#L{from}-L{to}"),
            Some(Extract::Pattern(p)) => write!(f, "#/{p}/"),
            None => Ok(()),
        }
    }
}

/// A context requirement declared in the workflow header region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequirement {
    pub pattern: RefPattern,
    /// CONTEXT-OPTIONAL: a miss is never an error.
    pub optional: bool,
    /// REQUIRE declares existence only; contents are not injected.
    pub inject: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_path() {
        let r = RefPattern::parse("@src/main.rs").unwrap();
        assert_eq!(r.pattern, "src/main.rs");
        assert_eq!(r.alias, None);
        assert_eq!(r.extract, None);
        assert!(!r.is_glob());
    }

    #[test]
    fn test_parse_recursive_glob() {
        let r = RefPattern::parse("@src/**/*.rs").unwrap();
        assert_eq!(r.pattern, "src/**/*.rs");
        assert!(r.is_glob());
    }

    #[test]
    fn test_parse_line_range() {
        let r = RefPattern::parse("@lib/io.rs#L10-L42").unwrap();
        assert_eq!(r.extract, Some(Extract::Lines { from: 10, to: 42 }));

        // L on both endpoints is optional on the second.
        let r = RefPattern::parse("@lib/io.rs#L10-42").unwrap();
        assert_eq!(r.extract, Some(Extract::Lines { from: 10, to: 42 }));
    }

    #[test]
    fn test_parse_regex_extract() {
        let r = RefPattern::parse("@lib/io.rs#/fn read_all/").unwrap();
        assert_eq!(r.extract, Some(Extract::Pattern("fn read_all".into())));
    }

    #[test]
    fn test_parse_alias() {
        let r = RefPattern::parse("@docs:guide/**.md").unwrap();
        assert_eq!(r.alias.as_deref(), Some("docs"));
        assert_eq!(r.pattern, "guide/**.md");
    }

    #[test]
    fn test_single_letter_prefix_is_not_alias() {
        let r = RefPattern::parse("@C:tools/x.cfg").unwrap();
        assert_eq!(r.alias, None);
        assert_eq!(r.pattern, "C:tools/x.cfg");
    }

    #[test]
    fn test_reversed_line_range_rejected() {
        assert!(RefPattern::parse("@a.rs#L9-L3").is_err());
        assert!(RefPattern::parse("@a.rs#L0-L3").is_err());
    }

    #[test]
    fn test_bad_suffix_rejected() {
        assert!(RefPattern::parse("@a.rs#chunk").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["@src/*.rs", "@docs:x.md#L1-L5", "@a.rs#/fn main/"] {
            let r = RefPattern::parse(s).unwrap();
            assert_eq!(r.to_string(), s.replace("#L1-L5", "#L1-L5"));
            let again = RefPattern::parse(&r.to_string()).unwrap();
            assert_eq!(r.pattern, again.pattern);
            assert_eq!(r.extract, again.extract);
        }
    }
}
