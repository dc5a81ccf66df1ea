//! Atomic change-set support for grouped file mutation
//!
//! Every lifecycle operation mutates at least two files (metadata plus
//! content); a change set captures the pre-image of each touched path
//! before the write so the whole group can be rolled back as one unit.
//! The set is an explicit value created by [`ChangeSet::begin`] and passed
//! down the call chain; there is no ambient per-thread registry.

use crate::error::{RepositoryError, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Change-set status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetStatus {
    /// Mutations may still be staged
    Open,
    /// Durability boundary reached; pre-images discarded
    Committed,
    /// All staged paths restored to their pre-images
    RolledBack,
}

/// A staged path with its captured pre-image.
/// `pre_image == None` means the file did not exist before the operation.
#[derive(Debug)]
struct StagedPath {
    path: PathBuf,
    pre_image: Option<Vec<u8>>,
}

/// An open change set for one logical repository operation
pub struct ChangeSet {
    label: String,
    status: ChangeSetStatus,
    staged: Vec<StagedPath>,
    seen: HashSet<PathBuf>,
}

impl ChangeSet {
    /// Begin a new change set. The label identifies the enclosing
    /// operation in log output.
    pub fn begin(label: impl Into<String>) -> Self {
        let label = label.into();
        tracing::debug!(changeset = %label, "change set opened");
        Self {
            label,
            status: ChangeSetStatus::Open,
            staged: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Stage a path for mutation, capturing its current bytes as the
    /// pre-image. Must be called before the physical write or delete.
    /// Idempotent: staging the same path twice keeps the first pre-image.
    pub fn stage(&mut self, path: &Path) -> Result<()> {
        if self.status != ChangeSetStatus::Open {
            return Err(RepositoryError::Storage(format!(
                "change set '{}' is closed",
                self.label
            )));
        }
        if self.seen.contains(path) {
            return Ok(());
        }
        let pre_image = if path.exists() {
            Some(fs::read(path)?)
        } else {
            None
        };
        self.seen.insert(path.to_path_buf());
        self.staged.push(StagedPath {
            path: path.to_path_buf(),
            pre_image,
        });
        Ok(())
    }

    pub fn status(&self) -> ChangeSetStatus {
        self.status
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Commit the change set. The staged writes were already applied
    /// directly; committing discards the pre-images, making this the
    /// durability boundary for the enclosing operation.
    pub fn commit(mut self) -> Result<()> {
        if self.status != ChangeSetStatus::Open {
            return Err(RepositoryError::Storage(format!(
                "change set '{}' is closed",
                self.label
            )));
        }
        tracing::debug!(changeset = %self.label, paths = self.staged.len(), "change set committed");
        self.status = ChangeSetStatus::Committed;
        self.staged.clear();
        Ok(())
    }

    /// Roll back every staged path: files that did not exist before are
    /// deleted, modified files get their pre-image bytes rewritten.
    /// Restore failures are logged and suppressed; rollback runs in
    /// cleanup paths where a secondary error must not mask the original.
    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        if self.status != ChangeSetStatus::Open {
            return;
        }
        // Restore in reverse staging order.
        for staged in self.staged.iter().rev() {
            let result = match &staged.pre_image {
                Some(bytes) => restore_file(&staged.path, bytes),
                None => remove_if_exists(&staged.path),
            };
            if let Err(e) = result {
                tracing::error!(
                    changeset = %self.label,
                    path = %staged.path.display(),
                    "rollback restore failed: {}",
                    e
                );
            }
        }
        tracing::debug!(changeset = %self.label, paths = self.staged.len(), "change set rolled back");
        self.status = ChangeSetStatus::RolledBack;
        self.staged.clear();
    }
}

impl Drop for ChangeSet {
    fn drop(&mut self) {
        if self.status == ChangeSetStatus::Open && !self.staged.is_empty() {
            tracing::warn!(
                changeset = %self.label,
                paths = self.staged.len(),
                "dangling change set dropped without commit; rolling back"
            );
            self.rollback_in_place();
        }
    }
}

fn restore_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
