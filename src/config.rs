use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

const DEFAULT_MAX_PARALLEL: usize = 4;

/// What happens to the losing node of a `conflicts_with` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The loser stays blocked for the rest of the run.
    #[default]
    Block,
    /// The loser is re-admitted later in the same run if the winner fails.
    RunIfWinnerFails,
}

/// Confidence thresholds and timeouts for relationship detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Lexical results above this are returned without escalation.
    pub lexical_accept: f64,
    /// Similarity results above this are returned without escalation.
    pub similarity_accept: f64,
    /// Similarity above this means synergistic.
    pub synergy_threshold: f64,
    /// Per-call budget for the semantic classifier.
    pub semantic_timeout_ms: u64,
    /// Confidence attached to a semantic classifier answer.
    pub semantic_confidence: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            lexical_accept: 0.8,
            similarity_accept: 0.7,
            synergy_threshold: 0.7,
            semantic_timeout_ms: 5_000,
            semantic_confidence: 0.85,
        }
    }
}

impl DetectionConfig {
    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_millis(self.semantic_timeout_ms)
    }
}

/// Retry behaviour for best-effort store writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently executing tasks within a level.
    pub max_parallel: usize,
    pub conflict_policy: ConflictPolicy,
    pub detection: DetectionConfig,
    pub store: StoreConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            conflict_policy: ConflictPolicy::default(),
            detection: DetectionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn goalweave_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".goalweave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::goalweave_dir()?.join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_parallel = config.max_parallel,
            conflict_policy = ?config.conflict_policy,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".to_string()));
        }
        let d = &self.detection;
        for (name, value) in [
            ("lexical_accept", d.lexical_accept),
            ("similarity_accept", d.similarity_accept),
            ("synergy_threshold", d.synergy_threshold),
            ("semantic_confidence", d.semantic_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!(
                    "detection.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}
