//! Explicit configuration values. Each component receives its own section at
//! construction, so several differently configured instances can coexist in
//! one process.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CovtrendError, Result};

/// Top-level configuration, matching `covtrend.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub compare: CompareConfig,
}

/// Store retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Records older than this are purged by cleanup. 0 disables.
    pub retention_days: u32,
    /// Maximum records kept per branch. 0 disables.
    pub max_entries: usize,
    /// Run cleanup for the branch after every record.
    pub auto_cleanup: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            max_entries: 1000,
            auto_cleanup: true,
        }
    }
}

/// Merge/sync settings for externally held history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Records kept after a merge. 0 keeps everything.
    pub max_runs: usize,
    /// Fetched records older than this are dropped. 0 disables.
    pub max_age_days: u32,
    /// Branch whose history is used when the requested branch has none.
    pub fallback_branch: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_runs: 100,
            max_age_days: 90,
            fallback_branch: "main".to_string(),
        }
    }
}

/// Thresholds for the comparison engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Per-file delta (percentage points) that makes a change significant.
    pub significant_threshold: f64,
    /// New files below this coverage are flagged.
    pub acceptable_threshold: f64,
    /// Cap on the significant-file list. 0 disables.
    pub max_significant_files: usize,
    /// Path prefixes stripped before matching files, e.g. a Go module path.
    pub strip_prefixes: Vec<String>,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            significant_threshold: 5.0,
            acceptable_threshold: 75.0,
            max_significant_files: 20,
            strip_prefixes: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CovtrendError::storage(path, e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| CovtrendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.compare;
        if !c.significant_threshold.is_finite() || c.significant_threshold < 0.0 {
            return Err(CovtrendError::Config(format!(
                "compare.significant_threshold must be >= 0, got {}",
                c.significant_threshold
            )));
        }
        if !(0.0..=100.0).contains(&c.acceptable_threshold) {
            return Err(CovtrendError::Config(format!(
                "compare.acceptable_threshold must be within 0-100, got {}",
                c.acceptable_threshold
            )));
        }
        if self.merge.fallback_branch.trim().is_empty() {
            return Err(CovtrendError::Config(
                "merge.fallback_branch must not be empty".into(),
            ));
        }
        Ok(())
    }
}
