//! Pipeline configuration: CLI flags merged over an optional on-disk file
//! over hardcoded defaults, a three-tier precedence with a JSON-on-disk
//! file format.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

fn default_max_concurrent_engineers() -> u32 {
    10
}
fn default_max_turns() -> u32 {
    20
}
fn default_base_branch() -> String {
    "main".to_string()
}
fn default_max_review_retries() -> u32 {
    5
}
fn default_max_dev_retries() -> u32 {
    3
}
fn default_max_merge_retries() -> u32 {
    3
}

/// Typed pipeline configuration. Deserializes from `<base_repo>/.kugutsu/config.json`;
/// any field absent there falls back to its `#[serde(default = ...)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_engineers")]
    pub max_concurrent_engineers: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    pub base_repo: PathBuf,
    pub worktree_base: PathBuf,
    #[serde(default)]
    pub use_remote: bool,
    #[serde(default = "default_max_review_retries")]
    pub max_review_retries: u32,
    #[serde(default = "default_max_dev_retries")]
    pub max_dev_retries: u32,
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,
}

impl PipelineConfig {
    /// Hardcoded defaults, requiring only the two paths that have no
    /// sensible default.
    pub fn defaults(base_repo: PathBuf, worktree_base: PathBuf) -> Self {
        Self {
            max_concurrent_engineers: default_max_concurrent_engineers(),
            max_turns: default_max_turns(),
            base_branch: default_base_branch(),
            base_repo,
            worktree_base,
            use_remote: false,
            max_review_retries: default_max_review_retries(),
            max_dev_retries: default_max_dev_retries(),
            max_merge_retries: default_max_merge_retries(),
        }
    }

    /// Loads `<base_repo>/.kugutsu/config.json` if present and merges it
    /// over `defaults`; a missing file is not an error.
    pub fn load_merged(defaults: PipelineConfig) -> Result<PipelineConfig, ConfigError> {
        let config_path = defaults.base_repo.join(".kugutsu").join("config.json");
        if !config_path.exists() {
            return Ok(defaults);
        }
        let raw = std::fs::read_to_string(&config_path)?;
        let from_file: PipelineConfigFile = serde_json::from_str(&raw)?;
        Ok(from_file.merge_over(defaults))
    }

    pub fn save_to(&self, base_repo: &Path) -> Result<(), ConfigError> {
        let dir = base_repo.join(".kugutsu");
        std::fs::create_dir_all(&dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join("config.json"), raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_concurrent_engineers) {
            return Err(ConfigError::Validation(format!(
                "max_concurrent_engineers must be in 1..=100, got {}",
                self.max_concurrent_engineers
            )));
        }
        if !(5..=50).contains(&self.max_turns) {
            return Err(ConfigError::Validation(format!(
                "max_turns must be in 5..=50, got {}",
                self.max_turns
            )));
        }
        if !self.base_repo.is_dir() {
            return Err(ConfigError::Validation(format!(
                "base_repo {} is not a directory",
                self.base_repo.display()
            )));
        }
        if !self.base_repo.join(".git").exists() {
            return Err(ConfigError::Validation(format!(
                "base_repo {} is not a git repository",
                self.base_repo.display()
            )));
        }
        Ok(())
    }
}

/// All-optional mirror of [`PipelineConfig`] used only to parse a partial
/// on-disk file and overlay it onto the already-resolved defaults.
#[derive(Debug, Deserialize)]
struct PipelineConfigFile {
    max_concurrent_engineers: Option<u32>,
    max_turns: Option<u32>,
    base_branch: Option<String>,
    base_repo: Option<PathBuf>,
    worktree_base: Option<PathBuf>,
    use_remote: Option<bool>,
    max_review_retries: Option<u32>,
    max_dev_retries: Option<u32>,
    max_merge_retries: Option<u32>,
}

impl PipelineConfigFile {
    fn merge_over(self, mut base: PipelineConfig) -> PipelineConfig {
        if let Some(v) = self.max_concurrent_engineers {
            base.max_concurrent_engineers = v;
        }
        if let Some(v) = self.max_turns {
            base.max_turns = v;
        }
        if let Some(v) = self.base_branch {
            base.base_branch = v;
        }
        if let Some(v) = self.base_repo {
            base.base_repo = v;
        }
        if let Some(v) = self.worktree_base {
            base.worktree_base = v;
        }
        if let Some(v) = self.use_remote {
            base.use_remote = v;
        }
        if let Some(v) = self.max_review_retries {
            base.max_review_retries = v;
        }
        if let Some(v) = self.max_dev_retries {
            base.max_dev_retries = v;
        }
        if let Some(v) = self.max_merge_retries {
            base.max_merge_retries = v;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_max_engineers() {
        let mut cfg = PipelineConfig::defaults(PathBuf::from("."), PathBuf::from("/tmp"));
        cfg.max_concurrent_engineers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn file_merge_overrides_only_present_fields() {
        let base = PipelineConfig::defaults(PathBuf::from("/repo"), PathBuf::from("/wt"));
        let file = PipelineConfigFile {
            max_concurrent_engineers: Some(25),
            max_turns: None,
            base_branch: None,
            base_repo: None,
            worktree_base: None,
            use_remote: None,
            max_review_retries: None,
            max_dev_retries: None,
            max_merge_retries: None,
        };
        let merged = file.merge_over(base);
        assert_eq!(merged.max_concurrent_engineers, 25);
        assert_eq!(merged.max_turns, 20);
        assert_eq!(merged.base_branch, "main");
    }
}
