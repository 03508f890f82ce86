//! Operator configuration.
//!
//! A TOML file located via `SDQCTL_CONFIG` (default
//! `~/.sdqctl/config.toml`), loaded once at startup and immutable for the
//! process lifetime. It supplies defaults below CLI flags and workflow
//! directives: the fallback adapter and model, the session store root, and
//! named workspace roots usable as `alias:` prefixes in references.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "SDQCTL_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub default_adapter: Option<String>,
    pub default_model: Option<String>,
    pub session_dir: Option<PathBuf>,
    #[serde(default)]
    pub workspace_aliases: HashMap<String, PathBuf>,
}

impl OperatorConfig {
    /// Load from `SDQCTL_CONFIG`, falling back to `~/.sdqctl/config.toml`.
    /// A missing file is an empty config, not an error.
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => match dirs::home_dir() {
                Some(home) => home.join(".sdqctl").join("config.toml"),
                None => return Ok(Self::default()),
            },
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: OperatorConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        debug!("loaded operator config from {}", path.display());
        Ok(config)
    }
}
