//! Model selection constraints.
//!
//! A workflow names either a fixed model id (MODEL) or a constraint bag
//! (MODEL-REQUIRES / MODEL-PREFERS) that the adapter satisfies at session
//! start. MODEL-POLICY names an adapter-interpreted selection policy.

use serde::{Deserialize, Serialize};

/// Coarse pricing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Economy,
    Standard,
    Premium,
}

/// Latency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSpeed {
    Fast,
    Standard,
    Deliberate,
}

/// Primary capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCapability {
    Code,
    Reasoning,
    General,
}

/// One constraint in a requirement bag, authored as `key:value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ModelRequirement {
    /// Minimum context window in tokens.
    Context(u64),
    Tier(ModelTier),
    Speed(ModelSpeed),
    Capability(ModelCapability),
    Vendor(String),
    Family(String),
}

impl std::str::FromStr for ModelRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once(':')
            .ok_or_else(|| format!("requirement {s:?} is not key:value"))?;
        match key.to_ascii_lowercase().as_str() {
            "context" => value
                .parse::<u64>()
                .map(ModelRequirement::Context)
                .map_err(|_| format!("context requirement {value:?} is not an integer")),
            "tier" => match value.to_ascii_lowercase().as_str() {
                "economy" => Ok(ModelRequirement::Tier(ModelTier::Economy)),
                "standard" => Ok(ModelRequirement::Tier(ModelTier::Standard)),
                "premium" => Ok(ModelRequirement::Tier(ModelTier::Premium)),
                other => Err(format!("unknown tier {other:?}")),
            },
            "speed" => match value.to_ascii_lowercase().as_str() {
                "fast" => Ok(ModelRequirement::Speed(ModelSpeed::Fast)),
                "standard" => Ok(ModelRequirement::Speed(ModelSpeed::Standard)),
                "deliberate" => Ok(ModelRequirement::Speed(ModelSpeed::Deliberate)),
                other => Err(format!("unknown speed {other:?}")),
            },
            "capability" => match value.to_ascii_lowercase().as_str() {
                "code" => Ok(ModelRequirement::Capability(ModelCapability::Code)),
                "reasoning" => Ok(ModelRequirement::Capability(ModelCapability::Reasoning)),
                "general" => Ok(ModelRequirement::Capability(ModelCapability::General)),
                other => Err(format!("unknown capability {other:?}")),
            },
            "vendor" => Ok(ModelRequirement::Vendor(value.to_string())),
            "family" => Ok(ModelRequirement::Family(value.to_string())),
            other => Err(format!("unknown requirement key {other:?}")),
        }
    }
}

impl std::fmt::Display for ModelRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRequirement::Context(n) => write!(f, "context:{n}"),
            ModelRequirement::Tier(t) => write!(f, "tier:{}", format!("{t:?}").to_lowercase()),
            ModelRequirement::Speed(s) => write!(f, "speed:{}", format!("{s:?}").to_lowercase()),
            ModelRequirement::Capability(c) => {
                write!(f, "capability:{}", format!("{c:?}").to_lowercase())
            }
            ModelRequirement::Vendor(v) => write!(f, "vendor:{v}"),
            ModelRequirement::Family(v) => write!(f, "family:{v}"),
        }
    }
}

/// Model selection as authored in the header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Fixed id from MODEL; wins over requirements when set.
    pub id: Option<String>,
    /// Hard constraints; all must hold.
    #[serde(default)]
    pub requires: Vec<ModelRequirement>,
    /// Soft constraints; used to rank candidates.
    #[serde(default)]
    pub prefers: Vec<ModelRequirement>,
    /// Adapter-interpreted policy name.
    pub policy: Option<String>,
}

impl ModelSpec {
    pub fn fixed(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.requires.is_empty() && self.prefers.is_empty() && self.policy.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements() {
        assert_eq!(
            "context:200000".parse::<ModelRequirement>().unwrap(),
            ModelRequirement::Context(200_000)
        );
        assert_eq!(
            "tier:premium".parse::<ModelRequirement>().unwrap(),
            ModelRequirement::Tier(ModelTier::Premium)
        );
        assert_eq!(
            "capability:code".parse::<ModelRequirement>().unwrap(),
            ModelRequirement::Capability(ModelCapability::Code)
        );
        assert_eq!(
            "vendor:anthropic".parse::<ModelRequirement>().unwrap(),
            ModelRequirement::Vendor("anthropic".into())
        );
    }

    #[test]
    fn test_parse_rejects_bad_requirements() {
        assert!("context:lots".parse::<ModelRequirement>().is_err());
        assert!("tier:platinum".parse::<ModelRequirement>().is_err());
        assert!("nonsense".parse::<ModelRequirement>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["context:128000", "tier:economy", "speed:deliberate", "family:sonnet"] {
            let req: ModelRequirement = s.parse().unwrap();
            assert_eq!(req.to_string(), s);
        }
    }
}
