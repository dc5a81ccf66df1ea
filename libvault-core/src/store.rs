//! Filesystem store for metadata and content documents
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   repository-config.json
//!   {ns-segments...}/
//!     nsid.txt                       — case-preserved segment name
//!     {version}/
//!       {filename}                   — content file
//!       {basename}-info.json         — metadata document
//!       history/{basename}-history.json
//!       history/{filename}.{NNN}     — immutable content snapshots
//!       wip/{filename}               — work-in-process copy
//! ```
//!
//! The store is purely mechanical I/O plus change-set registration: every
//! write or delete is preceded by `stage` on the affected path, and the
//! caller rolls back the enclosing change set on any failure. Namespace
//! folder names are lowercased; `nsid.txt` recovers the original case.

use crate::changeset::ChangeSet;
use crate::context::RepositoryContext;
use crate::error::{RepositoryError, Result};
use crate::item::{ItemKey, ItemMetadata};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Filesystem store for one repository instance
pub struct FileStore {
    context: Arc<RepositoryContext>,
}

impl FileStore {
    pub fn new(context: Arc<RepositoryContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<RepositoryContext> {
        &self.context
    }

    // ==================== Path Derivation ====================

    /// Split a base namespace into folder segments. URI-style namespaces
    /// contribute their scheme, reversed authority, and path segments;
    /// plain identifiers map to their colon/slash-separated parts.
    pub fn namespace_segments(base_namespace: &str) -> Vec<String> {
        let (scheme, rest) = match base_namespace.split_once("://") {
            Some((s, r)) => (Some(s), r),
            None => (None, base_namespace),
        };

        let mut segments: Vec<String> = Vec::new();
        if let Some(scheme) = scheme {
            segments.push(sanitize_segment(scheme));
        }

        let mut parts = rest.split(['/', ':']).filter(|s| !s.is_empty());
        if scheme.is_some() {
            if let Some(authority) = parts.next() {
                segments.extend(
                    authority
                        .split('.')
                        .rev()
                        .filter(|s| !s.is_empty())
                        .map(sanitize_segment),
                );
            }
        }
        segments.extend(parts.map(sanitize_segment));

        if segments.is_empty() {
            segments.push("_".to_string());
        }
        segments
    }

    /// Directory holding all versions of a namespace's items. Memoized in
    /// the context cache; invalidated when the namespace is deleted.
    pub fn namespace_dir(&self, base_namespace: &str) -> PathBuf {
        if let Some(dir) = self.context.cached_namespace_dir(base_namespace) {
            return dir;
        }
        let mut dir = self.context.root().to_path_buf();
        for segment in Self::namespace_segments(base_namespace) {
            dir.push(segment.to_lowercase());
        }
        self.context.cache_namespace_dir(base_namespace, dir.clone());
        dir
    }

    /// Directory holding one item version's artifacts.
    pub fn item_dir(&self, key: &ItemKey) -> PathBuf {
        self.namespace_dir(&key.base_namespace)
            .join(sanitize_segment(&key.version))
    }

    pub fn content_path(&self, key: &ItemKey) -> PathBuf {
        self.item_dir(key).join(&key.filename)
    }

    pub fn metadata_path(&self, key: &ItemKey) -> PathBuf {
        self.item_dir(key)
            .join(format!("{}-info.json", key.basename()))
    }

    pub fn history_dir(&self, key: &ItemKey) -> PathBuf {
        self.item_dir(key).join("history")
    }

    pub fn history_doc_path(&self, key: &ItemKey) -> PathBuf {
        self.history_dir(key)
            .join(format!("{}-history.json", key.basename()))
    }

    pub fn snapshot_path(&self, key: &ItemKey, commit_number: u32) -> PathBuf {
        self.history_dir(key)
            .join(format!("{}.{:03}", key.filename, commit_number))
    }

    pub fn wip_path(&self, key: &ItemKey) -> PathBuf {
        self.item_dir(key).join("wip").join(&key.filename)
    }

    // ==================== Namespace Folders ====================

    /// Create the namespace folder chain, writing a case-preserving
    /// `nsid.txt` into each newly created segment folder. The marker files
    /// are staged so a rolled-back initial publish leaves no trace.
    pub fn ensure_namespace_dir(
        &self,
        changeset: &mut ChangeSet,
        base_namespace: &str,
    ) -> Result<PathBuf> {
        let mut dir = self.context.root().to_path_buf();
        for segment in Self::namespace_segments(base_namespace) {
            dir.push(segment.to_lowercase());
            fs::create_dir_all(&dir)?;
            let nsid = dir.join("nsid.txt");
            if !nsid.exists() {
                changeset.stage(&nsid)?;
                atomic_write(&nsid, segment.as_bytes())?;
            }
        }
        Ok(dir)
    }

    /// Read the case-preserved name of a namespace folder.
    pub fn read_namespace_id(dir: &Path) -> Result<String> {
        let nsid = dir.join("nsid.txt");
        let raw = fs::read_to_string(&nsid)
            .map_err(|_| RepositoryError::not_found(format!("nsid.txt under {}", dir.display())))?;
        Ok(raw.trim().to_string())
    }

    // ==================== Metadata Documents ====================

    pub fn metadata_exists(&self, key: &ItemKey) -> bool {
        self.metadata_path(key).exists()
    }

    pub fn read_metadata(&self, key: &ItemKey) -> Result<ItemMetadata> {
        let path = self.metadata_path(key);
        if !path.exists() {
            return Err(RepositoryError::not_found(format!("item {}", key)));
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| RepositoryError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    pub fn write_metadata(
        &self,
        changeset: &mut ChangeSet,
        metadata: &ItemMetadata,
    ) -> Result<()> {
        let path = self.metadata_path(&metadata.key());
        changeset.stage(&path)?;
        let data = serde_json::to_string_pretty(metadata)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        atomic_write(&path, data.as_bytes())?;
        Ok(())
    }

    // ==================== Content Files ====================

    pub fn read_content(&self, key: &ItemKey) -> Result<Vec<u8>> {
        let path = self.content_path(key);
        if !path.exists() {
            return Err(RepositoryError::not_found(format!("content for {}", key)));
        }
        Ok(fs::read(&path)?)
    }

    pub fn write_content(
        &self,
        changeset: &mut ChangeSet,
        key: &ItemKey,
        bytes: &[u8],
    ) -> Result<()> {
        let path = self.content_path(key);
        changeset.stage(&path)?;
        atomic_write(&path, bytes)?;
        Ok(())
    }

    // ==================== WIP Files ====================

    pub fn wip_exists(&self, key: &ItemKey) -> bool {
        self.wip_path(key).exists()
    }

    pub fn read_wip(&self, key: &ItemKey) -> Result<Vec<u8>> {
        let path = self.wip_path(key);
        if !path.exists() {
            return Err(RepositoryError::not_found(format!("WIP content for {}", key)));
        }
        Ok(fs::read(&path)?)
    }

    pub fn write_wip(&self, changeset: &mut ChangeSet, key: &ItemKey, bytes: &[u8]) -> Result<()> {
        let path = self.wip_path(key);
        changeset.stage(&path)?;
        atomic_write(&path, bytes)?;
        Ok(())
    }

    // ==================== Generic Staged Delete ====================

    /// Stage and remove a file. No-op when the file does not exist.
    pub fn delete_file(&self, changeset: &mut ChangeSet, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        changeset.stage(path)?;
        fs::remove_file(path)?;
        Ok(())
    }

    // ==================== Listing ====================

    /// All item metadata documents under a namespace.
    pub fn list_namespace_items(&self, base_namespace: &str) -> Result<Vec<ItemMetadata>> {
        let ns_dir = self.namespace_dir(base_namespace);
        let mut items = Vec::new();
        if ns_dir.exists() {
            self.scan_metadata(&ns_dir, &mut items)?;
        }
        items.sort_by(|a, b| {
            a.filename
                .cmp(&b.filename)
                .then_with(|| compare_versions(&b.version, &a.version))
        });
        Ok(items)
    }

    /// All versions of one library under a namespace, newest first by
    /// semantic-version order (lexicographic fallback for labels that do
    /// not parse).
    pub fn list_versions(&self, base_namespace: &str, filename: &str) -> Result<Vec<ItemMetadata>> {
        let mut items = self.list_namespace_items(base_namespace)?;
        items.retain(|m| m.filename == filename);
        items.sort_by(|a, b| compare_versions(&b.version, &a.version));
        Ok(items)
    }

    fn scan_metadata(&self, dir: &Path, out: &mut Vec<ItemMetadata>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                // history/ and wip/ hold no metadata documents, but the
                // scan is harmless there and keeps the walk simple.
                self.scan_metadata(&path, out)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("-info.json"))
                .unwrap_or(false)
            {
                let data = fs::read_to_string(&path)?;
                let metadata: ItemMetadata =
                    serde_json::from_str(&data).map_err(|e| RepositoryError::Corrupt {
                        path: path.clone(),
                        detail: e.to_string(),
                    })?;
                out.push(metadata);
            }
        }
        Ok(())
    }

    // ==================== Post-Delete Cleanup ====================

    /// Remove now-empty folders after a committed delete, invalidating the
    /// namespace cache entry when the namespace folder itself goes away.
    /// Best-effort: runs outside the transactional unit.
    pub fn cleanup_after_delete(&self, key: &ItemKey) {
        let item_dir = self.item_dir(key);
        for sub in ["history", "wip"] {
            let d = item_dir.join(sub);
            if dir_is_empty(&d) {
                let _ = fs::remove_dir(&d);
            }
        }
        if dir_is_empty(&item_dir) {
            let _ = fs::remove_dir(&item_dir);
        }

        let ns_dir = self.namespace_dir(&key.base_namespace);
        if only_nsid_left(&ns_dir) {
            let _ = fs::remove_file(ns_dir.join("nsid.txt"));
            if fs::remove_dir(&ns_dir).is_ok() {
                self.context.invalidate_namespace(&key.base_namespace);
            }
        }
    }
}

/// SHA-256 digest of content bytes, hex encoded. This is the integrity
/// value embedded in the metadata document.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Order two version labels, semver first, lexicographic fallback.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write atomically via temp file + rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

fn only_nsid_left(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut saw_nsid = false;
            for entry in entries.flatten() {
                if entry.file_name() == "nsid.txt" {
                    saw_nsid = true;
                } else {
                    return false;
                }
            }
            saw_nsid
        }
        Err(_) => false,
    }
}
