//! Repository context
//!
//! One context is constructed per repository instance and passed by
//! reference to the components that need it. It owns the process-wide
//! namespace-folder memo cache; there are no statics or singletons, so
//! two repository instances in one process never share state.

use crate::config::RepositoryConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Shared per-instance state: root path, configuration, and the
/// namespace-folder cache.
pub struct RepositoryContext {
    root: PathBuf,
    config: RepositoryConfig,
    /// base namespace -> resolved namespace directory
    namespace_dirs: Mutex<HashMap<String, PathBuf>>,
}

impl RepositoryContext {
    pub fn new(root: PathBuf, config: RepositoryConfig) -> Self {
        Self {
            root,
            config,
            namespace_dirs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Identifier of the local repository instance.
    pub fn repository_id(&self) -> &str {
        &self.config.repository_id
    }

    /// Look up a cached namespace directory.
    pub fn cached_namespace_dir(&self, base_namespace: &str) -> Option<PathBuf> {
        let cache = self
            .namespace_dirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(base_namespace).cloned()
    }

    /// Memoize a resolved namespace directory.
    pub fn cache_namespace_dir(&self, base_namespace: &str, dir: PathBuf) {
        let mut cache = self
            .namespace_dirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(base_namespace.to_string(), dir);
    }

    /// Invalidate a namespace entry. Must be called whenever a namespace
    /// folder is deleted from disk.
    pub fn invalidate_namespace(&self, base_namespace: &str) {
        let mut cache = self
            .namespace_dirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cache.remove(base_namespace).is_some() {
            tracing::debug!(namespace = base_namespace, "namespace cache entry invalidated");
        }
    }
}
