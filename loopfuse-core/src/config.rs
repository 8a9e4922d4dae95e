//! Pass configuration
//!
//! `FusionConfig` is persisted as JSON. Every field has a default, so a partial
//! file (or no file at all) is a valid configuration.
//!
//! ```json
//! { "policy": "greedy-chain", "anchor": "header:loop.a", "max_chain": 4, "trace": true }
//! ```

use crate::error::FusionError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How many loops the driver tries to fuse into the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainPolicy {
    /// Attempt exactly one anchor/candidate pair.
    SinglePair,
    /// Keep fusing following loops into the anchor until one is illegal.
    #[default]
    GreedyChain,
}

impl FromStr for ChainPolicy {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-pair" => Ok(ChainPolicy::SinglePair),
            "greedy-chain" => Ok(ChainPolicy::GreedyChain),
            other => Err(FusionError::InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainPolicy::SinglePair => write!(f, "single-pair"),
            ChainPolicy::GreedyChain => write!(f, "greedy-chain"),
        }
    }
}

/// Which discovered loop becomes the anchor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AnchorStrategy {
    /// The first loop in discovery order.
    #[default]
    First,
    /// The loop whose header block carries this label.
    Header(String),
}

impl FromStr for AnchorStrategy {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "first" {
            return Ok(AnchorStrategy::First);
        }
        match s.strip_prefix("header:") {
            Some(label) if !label.is_empty() => Ok(AnchorStrategy::Header(label.to_string())),
            _ => Err(FusionError::InvalidAnchor(s.to_string())),
        }
    }
}

impl TryFrom<String> for AnchorStrategy {
    type Error = FusionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnchorStrategy> for String {
    fn from(value: AnchorStrategy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AnchorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnchorStrategy::First => write!(f, "first"),
            AnchorStrategy::Header(label) => write!(f, "header:{}", label),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub policy: ChainPolicy,
    pub anchor: AnchorStrategy,
    /// Upper bound on fusion attempts per function under `greedy-chain`.
    pub max_chain: Option<usize>,
    /// Record the function text before and after the pass.
    pub trace: bool,
}

impl FusionConfig {
    /// Maximum number of anchor/candidate pairs the driver attempts.
    pub fn attempt_limit(&self) -> usize {
        match self.policy {
            ChainPolicy::SinglePair => 1,
            ChainPolicy::GreedyChain => self.max_chain.unwrap_or(usize::MAX),
        }
    }

    /// Load a configuration file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FusionConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FusionConfig::default();
        assert_eq!(config.policy, ChainPolicy::GreedyChain);
        assert_eq!(config.anchor, AnchorStrategy::First);
        assert_eq!(config.attempt_limit(), usize::MAX);
    }

    #[test]
    fn test_partial_json() {
        let config: FusionConfig =
            serde_json::from_str(r#"{ "policy": "single-pair", "anchor": "header:outer" }"#)
                .unwrap();
        assert_eq!(config.policy, ChainPolicy::SinglePair);
        assert_eq!(config.anchor, AnchorStrategy::Header("outer".to_string()));
        assert!(!config.trace);
        assert_eq!(config.attempt_limit(), 1);
    }

    #[test]
    fn test_invalid_anchor_rejected() {
        assert!(serde_json::from_str::<FusionConfig>(r#"{ "anchor": "last" }"#).is_err());
        assert_eq!(
            "header:".parse::<AnchorStrategy>(),
            Err(FusionError::InvalidAnchor("header:".to_string()))
        );
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("loopfuse-config-{}.json", std::process::id()));
        let config = FusionConfig {
            policy: ChainPolicy::GreedyChain,
            anchor: AnchorStrategy::Header("loop.b".to_string()),
            max_chain: Some(2),
            trace: true,
        };
        config.save(&path).unwrap();
        let loaded = FusionConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }
}
