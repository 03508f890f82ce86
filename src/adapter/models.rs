//! Model metadata and requirement-based selection.
//!
//! Adapters list the models they can reach; the catalog filters by the
//! workflow's hard requirements, ranks by soft preferences, and falls back
//! to a registry of well-known ids when an adapter cannot enumerate its
//! own. `SDQCTL_MODEL_ALIAS_<ID>` environment aliases are applied before
//! lookup, and `SDQCTL_MODEL_DEFAULT` names the model used when a workflow
//! does not.

use crate::error::{Error, Result};
use crate::workflow::model_req::{ModelCapability, ModelSpeed, ModelTier};
use crate::workflow::{ModelRequirement, ModelSpec};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MODEL_DEFAULT_ENV: &str = "SDQCTL_MODEL_DEFAULT";
pub const MODEL_ALIAS_PREFIX: &str = "SDQCTL_MODEL_ALIAS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub context_tokens: u64,
    pub tier: ModelTier,
    pub speed: ModelSpeed,
    pub capabilities: Vec<ModelCapability>,
    pub vendor: String,
    pub family: String,
}

impl ModelInfo {
    pub fn satisfies(&self, requirement: &ModelRequirement) -> bool {
        match requirement {
            ModelRequirement::Context(min) => self.context_tokens >= *min,
            ModelRequirement::Tier(tier) => self.tier == *tier,
            ModelRequirement::Speed(speed) => self.speed == *speed,
            ModelRequirement::Capability(cap) => self.capabilities.contains(cap),
            ModelRequirement::Vendor(vendor) => self.vendor.eq_ignore_ascii_case(vendor),
            ModelRequirement::Family(family) => self.family.eq_ignore_ascii_case(family),
        }
    }
}

/// Well-known models used when an adapter cannot enumerate its own.
pub fn fallback_registry() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "claude-opus".into(),
            context_tokens: 200_000,
            tier: ModelTier::Premium,
            speed: ModelSpeed::Deliberate,
            capabilities: vec![ModelCapability::Code, ModelCapability::Reasoning],
            vendor: "anthropic".into(),
            family: "opus".into(),
        },
        ModelInfo {
            id: "claude-sonnet".into(),
            context_tokens: 200_000,
            tier: ModelTier::Standard,
            speed: ModelSpeed::Standard,
            capabilities: vec![
                ModelCapability::Code,
                ModelCapability::Reasoning,
                ModelCapability::General,
            ],
            vendor: "anthropic".into(),
            family: "sonnet".into(),
        },
        ModelInfo {
            id: "claude-haiku".into(),
            context_tokens: 200_000,
            tier: ModelTier::Economy,
            speed: ModelSpeed::Fast,
            capabilities: vec![ModelCapability::General, ModelCapability::Code],
            vendor: "anthropic".into(),
            family: "haiku".into(),
        },
    ]
}

/// Resolve `SDQCTL_MODEL_ALIAS_<ID>` for a model id. The env key is the
/// uppercased id with non-alphanumerics mapped to underscores.
pub fn resolve_alias(id: &str) -> String {
    let key: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    match std::env::var(format!("{MODEL_ALIAS_PREFIX}{key}")) {
        Ok(alias) if !alias.is_empty() => {
            debug!("model alias: {id} -> {alias}");
            alias
        }
        _ => id.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        if models.is_empty() {
            Self {
                models: fallback_registry(),
            }
        } else {
            Self { models }
        }
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    /// Select a model for the workflow's spec.
    ///
    /// A fixed id wins outright (after alias resolution). Otherwise every
    /// hard requirement must hold, and candidates are ranked by how many
    /// soft preferences they satisfy, ties broken toward the cheaper tier.
    pub fn select(&self, spec: &ModelSpec) -> Result<String> {
        if let Some(id) = &spec.id {
            return Ok(resolve_alias(id));
        }

        let mut candidates: Vec<&ModelInfo> = self
            .models
            .iter()
            .filter(|m| spec.requires.iter().all(|r| m.satisfies(r)))
            .collect();

        if candidates.is_empty() {
            let requirements: Vec<String> = spec.requires.iter().map(|r| r.to_string()).collect();
            return Err(Error::ModelUnsupported(requirements.join(" ")));
        }

        candidates.sort_by(|a, b| {
            let pa = spec.prefers.iter().filter(|r| a.satisfies(r)).count();
            let pb = spec.prefers.iter().filter(|r| b.satisfies(r)).count();
            pb.cmp(&pa).then(a.tier.cmp(&b.tier))
        });
        Ok(candidates[0].id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(requires: &[&str], prefers: &[&str]) -> ModelSpec {
        ModelSpec {
            id: None,
            requires: requires.iter().map(|s| s.parse().unwrap()).collect(),
            prefers: prefers.iter().map(|s| s.parse().unwrap()).collect(),
            policy: None,
        }
    }

    #[test]
    fn test_fixed_id_wins() {
        let catalog = ModelCatalog::new(vec![]);
        let selected = catalog.select(&ModelSpec::fixed("my-model")).unwrap();
        assert_eq!(selected, "my-model");
    }

    #[test]
    fn test_requirements_filter() {
        let catalog = ModelCatalog::new(vec![]);
        let selected = catalog
            .select(&spec(&["tier:premium", "capability:reasoning"], &[]))
            .unwrap();
        assert_eq!(selected, "claude-opus");
    }

    #[test]
    fn test_unsatisfiable_requirements() {
        let catalog = ModelCatalog::new(vec![]);
        let err = catalog
            .select(&spec(&["context:900000000"], &[]))
            .unwrap_err();
        assert!(matches!(err, Error::ModelUnsupported(_)));
    }

    #[test]
    fn test_preferences_rank() {
        let catalog = ModelCatalog::new(vec![]);
        let selected = catalog
            .select(&spec(&["capability:code"], &["speed:fast"]))
            .unwrap();
        assert_eq!(selected, "claude-haiku");
    }

    #[test]
    fn test_tie_breaks_toward_cheaper_tier() {
        let catalog = ModelCatalog::new(vec![]);
        // No preferences: all candidates tie, economy wins.
        let selected = catalog.select(&spec(&["capability:code"], &[])).unwrap();
        assert_eq!(selected, "claude-haiku");
    }

    #[test]
    fn test_empty_catalog_uses_fallback() {
        let catalog = ModelCatalog::new(vec![]);
        assert_eq!(catalog.models().len(), 3);
    }
}
