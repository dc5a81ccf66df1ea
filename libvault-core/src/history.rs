//! Per-item commit history
//!
//! Each item carries an append-only history document plus one immutable
//! numbered snapshot of the content file per commit. Commit numbers start
//! at 0 and increase monotonically; the document lists entries
//! most-recent-first. Entries are never mutated after creation.

use crate::changeset::ChangeSet;
use crate::error::{RepositoryError, Result};
use crate::item::ItemKey;
use crate::store::{self, FileStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;

/// One committed revision of an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonically increasing per item, first entry = 0.
    pub commit_number: u32,
    pub user: String,
    pub effective_on: DateTime<Utc>,
    pub remarks: String,
    /// Name of the frozen content snapshot under `history/`.
    pub content_snapshot_filename: String,
}

/// On-disk history document, entries most-recent-first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryDocument {
    entries: Vec<HistoryEntry>,
}

/// Append-only history log over the file store
pub struct HistoryLog {
    store: Arc<FileStore>,
}

impl HistoryLog {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    /// Append a new entry, freezing the item's current content file as a
    /// numbered snapshot. Both the history document and the snapshot are
    /// staged in the active change set. Returns the assigned commit number.
    pub fn append(
        &self,
        changeset: &mut ChangeSet,
        key: &ItemKey,
        user: &str,
        effective_on: DateTime<Utc>,
        remarks: &str,
    ) -> Result<u32> {
        let mut doc = self.load_or_default(key)?;
        let commit_number = doc
            .entries
            .iter()
            .map(|e| e.commit_number)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);

        // Freeze the current content as the snapshot for this commit.
        let content = self.store.read_content(key)?;
        let snapshot_path = self.store.snapshot_path(key, commit_number);
        changeset.stage(&snapshot_path)?;
        store::atomic_write(&snapshot_path, &content)?;

        let snapshot_filename = snapshot_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{:03}", key.filename, commit_number));

        doc.entries.insert(
            0,
            HistoryEntry {
                commit_number,
                user: user.to_string(),
                effective_on,
                remarks: remarks.to_string(),
                content_snapshot_filename: snapshot_filename,
            },
        );
        self.write_doc(changeset, key, &doc)?;

        tracing::debug!(item = %key, commit = commit_number, "history entry appended");
        Ok(commit_number)
    }

    /// All entries for an item, most-recent-first. NotFound when the item
    /// has no history document.
    pub fn get(&self, key: &ItemKey) -> Result<Vec<HistoryEntry>> {
        let path = self.store.history_doc_path(key);
        if !path.exists() {
            return Err(RepositoryError::not_found(format!("history for {}", key)));
        }
        let data = fs::read_to_string(&path)?;
        let doc: HistoryDocument =
            serde_json::from_str(&data).map_err(|e| RepositoryError::Corrupt {
                path,
                detail: e.to_string(),
            })?;
        Ok(doc.entries)
    }

    /// Frozen content bytes for a specific commit number.
    pub fn historical_content(&self, key: &ItemKey, commit_number: u32) -> Result<Vec<u8>> {
        let entries = self.get(key)?;
        if !entries.iter().any(|e| e.commit_number == commit_number) {
            return Err(RepositoryError::not_found(format!(
                "commit {} of {}",
                commit_number, key
            )));
        }
        let path = self.store.snapshot_path(key, commit_number);
        if !path.exists() {
            return Err(RepositoryError::not_found(format!(
                "snapshot {} of {}",
                commit_number, key
            )));
        }
        Ok(fs::read(&path)?)
    }

    /// Frozen content as of an effective date: the newest commit whose
    /// `effective_on <= effective_date`. NotFound when no commit qualifies.
    pub fn historical_content_at(
        &self,
        key: &ItemKey,
        effective_date: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let entries = self.get(key)?;
        let entry = entries
            .iter()
            .find(|e| e.effective_on <= effective_date)
            .ok_or_else(|| {
                RepositoryError::not_found(format!(
                    "no commit of {} at or before {}",
                    key, effective_date
                ))
            })?;
        self.historical_content(key, entry.commit_number)
    }

    /// Remove the history document and every numbered snapshot, staging
    /// each path in the active change set. No-op when no history exists.
    pub fn delete(&self, changeset: &mut ChangeSet, key: &ItemKey) -> Result<()> {
        let doc_path = self.store.history_doc_path(key);
        if !doc_path.exists() {
            return Ok(());
        }
        for entry in self.get(key)? {
            let snapshot = self.store.snapshot_path(key, entry.commit_number);
            self.store.delete_file(changeset, &snapshot)?;
        }
        self.store.delete_file(changeset, &doc_path)?;
        Ok(())
    }

    fn load_or_default(&self, key: &ItemKey) -> Result<HistoryDocument> {
        let path = self.store.history_doc_path(key);
        if !path.exists() {
            return Ok(HistoryDocument::default());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| RepositoryError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    fn write_doc(
        &self,
        changeset: &mut ChangeSet,
        key: &ItemKey,
        doc: &HistoryDocument,
    ) -> Result<()> {
        let path = self.store.history_doc_path(key);
        changeset.stage(&path)?;
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        store::atomic_write(&path, data.as_bytes())?;
        Ok(())
    }
}
