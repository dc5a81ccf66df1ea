//! Repository configuration document
//!
//! Stored at `<repo-root>/repository-config.json`. Missing file means
//! defaults; saves go through a temp file and rename.

use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default interval between availability re-probes of a remote peer.
pub const DEFAULT_RECHECK_INTERVAL_SECS: u64 = 300;

/// Per-instance repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Identifier of this repository instance. Items whose
    /// `owning_repository` differs are delegated to a remote peer.
    pub repository_id: String,
    /// Human-readable name shown by administration tools.
    pub display_name: String,
    /// Seconds a successful availability probe stays cached.
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
    /// Optional authorization rule file, relative to the repository root.
    #[serde(default)]
    pub authz_file: Option<PathBuf>,
}

fn default_recheck_interval() -> u64 {
    DEFAULT_RECHECK_INTERVAL_SECS
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            repository_id: "local".to_string(),
            display_name: "Local Repository".to_string(),
            recheck_interval_secs: DEFAULT_RECHECK_INTERVAL_SECS,
            authz_file: None,
        }
    }
}

impl RepositoryConfig {
    /// Load config from a repository root, falling back to defaults when
    /// the file does not exist.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let config_path = Self::config_path(repo_root);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        serde_json::from_str(&data).map_err(|e| RepositoryError::Corrupt {
            path: config_path,
            detail: e.to_string(),
        })
    }

    /// Save config to a repository root.
    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let config_path = Self::config_path(repo_root);
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join("repository-config.json")
    }
}
