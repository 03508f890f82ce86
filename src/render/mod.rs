//! Versioned pipeline I/O.
//!
//! The renderer emits a structured JSON document describing the fully
//! resolved workflow (pre-execution) or the execution trace
//! (post-execution); `--from-json` consumes the same format. The schema
//! version is `MAJOR.MINOR`: unknown fields are ignored on read, new
//! optional fields only bump the minor, and a mismatched major is a hard
//! error.

use crate::error::{Error, Result};
use crate::workflow::{Step, Workflow};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchTaken {
    Success,
    Failure,
    None,
}

/// One step as rendered: its type, authored inputs, and (after execution)
/// outputs plus the branch taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedStep {
    #[serde(rename = "type")]
    pub step_type: String,
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_taken: Option<BranchTaken>,
}

impl RenderedStep {
    /// Render a model step. The tagged serde representation carries the
    /// type discriminant; it moves up to the `type` field and the rest
    /// stays as inputs.
    pub fn from_step(step: &Step) -> Result<Self> {
        let mut value = serde_json::to_value(step)?;
        let step_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => step.kind().to_string(),
        };
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        Ok(Self {
            step_type,
            inputs: value,
            outputs: None,
            branch_taken: None,
        })
    }

    /// Reconstruct the model step, reversing [`Self::from_step`].
    pub fn to_step(&self) -> Result<Step> {
        let mut value = self.inputs.clone();
        let object = value.as_object_mut().ok_or_else(|| {
            Error::Validation("rendered step inputs must be an object".into())
        })?;
        object.insert(
            "type".into(),
            serde_json::Value::String(self.step_type.clone()),
        );
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedCycle {
    pub cycle: u32,
    pub steps: Vec<RenderedStep>,
}

/// The top-level document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub schema_version: String,
    pub workflow_hash: String,
    pub cycles: Vec<RenderedCycle>,
    /// The full model, carried so `--from-json` can round-trip without
    /// reparsing the source file.
    pub workflow: Workflow,
}

impl RenderedDocument {
    /// Pre-execution rendering: the resolved step list as one planned cycle.
    pub fn plan(workflow: &Workflow) -> Result<Self> {
        let steps = workflow
            .steps
            .iter()
            .map(RenderedStep::from_step)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            workflow_hash: workflow.hash.clone(),
            cycles: vec![RenderedCycle { cycle: 1, steps }],
            workflow: workflow.clone(),
        })
    }

    /// Post-execution rendering from the engine's trace.
    pub fn trace(workflow: &Workflow, cycles: Vec<RenderedCycle>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            workflow_hash: workflow.hash.clone(),
            cycles,
            workflow: workflow.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate. Unknown fields are ignored; a different major
    /// version is a hard error.
    pub fn from_json(text: &str) -> Result<Self> {
        let document: RenderedDocument = serde_json::from_str(text)?;
        document.check_schema()?;
        Ok(document)
    }

    fn check_schema(&self) -> Result<()> {
        let major = self
            .schema_version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u64>().ok());
        let supported = semver::Version::parse(&format!("{SCHEMA_VERSION}.0"))
            .map_err(|e| Error::Internal(format!("bad builtin schema version: {e}")))?;
        match major {
            Some(major) if major == supported.major => Ok(()),
            _ => Err(Error::SchemaMismatch {
                found: self.schema_version.clone(),
                supported: SCHEMA_VERSION.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_str;
    use std::path::Path;

    fn workflow() -> Workflow {
        parse_str(
            "ADAPTER mock\nMAX-CYCLES 2\nPROMPT Say \"hello\".\nRUN /bin/echo ok\nON-FAILURE\nPROMPT Diagnose.\nEND\n",
            Path::new("demo.flow"),
        )
        .unwrap()
    }

    #[test]
    fn test_plan_shape() {
        let wf = workflow();
        let doc = RenderedDocument::plan(&wf).unwrap();
        assert_eq!(doc.schema_version, "1.0");
        assert_eq!(doc.workflow_hash, wf.hash);
        assert_eq!(doc.cycles.len(), 1);
        assert_eq!(doc.cycles[0].steps.len(), 2);
        assert_eq!(doc.cycles[0].steps[0].step_type, "prompt");
        assert_eq!(doc.cycles[0].steps[1].step_type, "run");
    }

    #[test]
    fn test_round_trip_preserves_model() {
        let wf = workflow();
        let doc = RenderedDocument::plan(&wf).unwrap();
        let json = doc.to_json().unwrap();
        let back = RenderedDocument::from_json(&json).unwrap();
        assert_eq!(back.workflow, wf);
    }

    #[test]
    fn test_step_round_trip() {
        let wf = workflow();
        for step in &wf.steps {
            let rendered = RenderedStep::from_step(step).unwrap();
            let back = rendered.to_step().unwrap();
            assert_eq!(&back, step);
        }
    }

    #[test]
    fn test_major_mismatch_is_hard_error() {
        let wf = workflow();
        let mut doc = RenderedDocument::plan(&wf).unwrap();
        doc.schema_version = "2.0".into();
        let json = doc.to_json().unwrap();
        assert!(matches!(
            RenderedDocument::from_json(&json).unwrap_err(),
            Error::SchemaMismatch { .. }
        ));
    }

    #[test]
    fn test_minor_bump_accepted() {
        let wf = workflow();
        let mut doc = RenderedDocument::plan(&wf).unwrap();
        doc.schema_version = "1.7".into();
        let json = doc.to_json().unwrap();
        assert!(RenderedDocument::from_json(&json).is_ok());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let wf = workflow();
        let doc = RenderedDocument::plan(&wf).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("experimental".into(), serde_json::json!({"x": 1}));
        assert!(RenderedDocument::from_json(&value.to_string()).is_ok());
    }
}
