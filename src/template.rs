//! Template expansion over directive arguments and prompt bodies.
//!
//! Variables are written `{NAME}` and expanded exactly once, before
//! execution. The built-in set is closed: `WORKFLOW_PATH`, `WORKFLOW_HASH`,
//! `SESSION_ID`, `CYCLE`, `STEP_INDEX`, `TIMESTAMP`, `STOP_FILE`. The
//! workflow's file stem is deliberately not a default variable; authors who
//! want it must ask for `__WORKFLOW_NAME__` explicitly, since assistant
//! backends have been observed to infer a role from a filename embedded in
//! a prompt.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("template variable regex"));

/// Layered variable environment. Later layers win: defaults, then
/// workflow-literal values, then CLI `--var`, then JSON-stdin.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    defaults: HashMap<String, String>,
    workflow: HashMap<String, String>,
    cli: HashMap<String, String>,
    json: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.defaults.insert(name.into(), value.into());
    }

    pub fn set_workflow(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.workflow.insert(name.into(), value.into());
    }

    pub fn set_cli(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cli.insert(name.into(), value.into());
    }

    pub fn set_json(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.json.insert(name.into(), value.into());
    }

    /// Merge CLI `KEY=VALUE` pairs.
    pub fn add_cli_pairs<'a>(&mut self, pairs: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for pair in pairs {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("--var expects KEY=VALUE, got {pair:?}")))?;
            self.set_cli(key.trim(), value);
        }
        Ok(())
    }

    /// Merge a JSON object supplied on stdin.
    pub fn add_json_object(&mut self, value: &serde_json::Value) -> Result<()> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Validation("stdin variables must be a JSON object".into()))?;
        for (key, value) in object {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.set_json(key, rendered);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.json
            .get(name)
            .or_else(|| self.cli.get(name))
            .or_else(|| self.workflow.get(name))
            .or_else(|| self.defaults.get(name))
            .map(String::as_str)
    }
}

/// Result of expanding one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expanded {
    pub text: String,
    pub warnings: Vec<String>,
}

/// Expand `{NAME}` references in `text`.
///
/// In strict mode an unknown variable is an error; lenient mode leaves the
/// token intact and records a warning.
pub fn expand(text: &str, vars: &Variables, strict: bool, step_index: usize) -> Result<Expanded> {
    let mut warnings = Vec::new();
    let mut unknown: Option<String> = None;
    let out = VAR.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.to_string(),
            None => {
                if unknown.is_none() {
                    unknown = Some(name.to_string());
                }
                warnings.push(format!("unknown template variable {{{name}}} left intact"));
                caps[0].to_string()
            }
        }
    });
    if strict {
        if let Some(name) = unknown {
            return Err(Error::UnresolvedTemplate { name, step_index });
        }
    }
    Ok(Expanded {
        text: out.into_owned(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.set_default("CYCLE", "1");
        v.set_default("SESSION_ID", "sess-1234");
        v
    }

    #[test]
    fn test_expand_builtin() {
        let out = expand("cycle {CYCLE} in {SESSION_ID}", &vars(), true, 0).unwrap();
        assert_eq!(out.text, "cycle 1 in sess-1234");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_unknown_strict_errors() {
        let err = expand("hello {NOPE}", &vars(), true, 3).unwrap_err();
        match err {
            Error::UnresolvedTemplate { name, step_index } => {
                assert_eq!(name, "NOPE");
                assert_eq!(step_index, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unknown_lenient_keeps_token() {
        let out = expand("Step 2 about {option}.", &vars(), false, 0).unwrap();
        assert_eq!(out.text, "Step 2 about {option}.");
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_precedence_json_over_cli_over_workflow_over_default() {
        let mut v = Variables::new();
        v.set_default("X", "default");
        assert_eq!(v.get("X"), Some("default"));
        v.set_workflow("X", "workflow");
        assert_eq!(v.get("X"), Some("workflow"));
        v.set_cli("X", "cli");
        assert_eq!(v.get("X"), Some("cli"));
        v.set_json("X", "json");
        assert_eq!(v.get("X"), Some("json"));
    }

    #[test]
    fn test_cli_pairs() {
        let mut v = Variables::new();
        v.add_cli_pairs(["option=A", "target=src/lib.rs"]).unwrap();
        assert_eq!(v.get("option"), Some("A"));
        assert_eq!(v.get("target"), Some("src/lib.rs"));
        assert!(v.add_cli_pairs(["notapair"]).is_err());
    }

    #[test]
    fn test_json_object() {
        let mut v = Variables::new();
        v.add_json_object(&serde_json::json!({"option": "B", "count": 3}))
            .unwrap();
        assert_eq!(v.get("option"), Some("B"));
        assert_eq!(v.get("count"), Some("3"));
        assert!(v.add_json_object(&serde_json::json!(["list"])).is_err());
    }

    #[test]
    fn test_workflow_name_not_injected_by_default() {
        let v = vars();
        let out = expand("role: {WORKFLOW_NAME}", &v, false, 0).unwrap();
        assert_eq!(out.text, "role: {WORKFLOW_NAME}");
    }

    #[test]
    fn test_opt_in_workflow_name() {
        let mut v = vars();
        v.set_default("__WORKFLOW_NAME__", "deploy-check");
        let out = expand("using {__WORKFLOW_NAME__}", &v, true, 0).unwrap();
        assert_eq!(out.text, "using deploy-check");
    }
}
