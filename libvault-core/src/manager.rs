//! Repository lifecycle engine
//!
//! Drives the per-item state machine: publish, lock, unlock, commit,
//! revert, promote, demote, update_status, recalculate_crc, delete.
//! Every state-changing operation follows the same protocol: acquire the
//! item's mutex, begin a change set, validate preconditions against the
//! loaded metadata (failing fast while the set is still empty), apply the
//! staged file mutations, append history where indicated, then commit the
//! set and notify listeners. Any error between begin and commit rolls the
//! change set back, leaving the prior state intact on disk.
//!
//! Items owned by another repository are delegated wholesale to the
//! registered [`RemoteRepository`] peer after an availability check; the
//! local change-set and history machinery applies only to local items.

use crate::authz::{AccessLevel, AllowAllProvider, AuthzProvider, AuthzResult, NamespaceAuthzProvider};
use crate::availability::AvailabilityChecker;
use crate::changeset::ChangeSet;
use crate::config::RepositoryConfig;
use crate::context::RepositoryContext;
use crate::error::{RepositoryError, Result};
use crate::history::{HistoryEntry, HistoryLog};
use crate::item::{ItemKey, ItemMetadata, LibraryStatus, RepositoryItemState, VersionScheme};
use crate::listener::RepositoryListener;
use crate::remote::{PeerRegistry, RemoteRepository};
use crate::store::{self, FileStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Input for a publish operation
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub base_namespace: String,
    pub filename: String,
    pub version: String,
    pub version_scheme: VersionScheme,
    pub content: Vec<u8>,
    pub user: String,
}

impl PublishRequest {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            base_namespace: self.base_namespace.clone(),
            filename: self.filename.clone(),
            version: self.version.clone(),
            version_scheme: self.version_scheme,
        }
    }
}

/// Filesystem-backed repository manager
pub struct RepositoryManager {
    context: Arc<RepositoryContext>,
    store: Arc<FileStore>,
    history: HistoryLog,
    listeners: Mutex<Vec<Arc<dyn RepositoryListener>>>,
    peers: Arc<PeerRegistry>,
    availability: Arc<AvailabilityChecker>,
    authz: Arc<dyn AuthzProvider>,
    /// Per-item mutation guard; held for the whole lifecycle operation.
    item_locks: Mutex<HashMap<ItemKey, Arc<Mutex<()>>>>,
}

impl RepositoryManager {
    /// Open a repository at the given root, creating it if necessary.
    /// The authorization provider comes from the configured rule file, or
    /// allows everything when none is configured.
    pub fn open(root: &Path) -> Result<Self> {
        let config = RepositoryConfig::load(root)?;
        let authz: Arc<dyn AuthzProvider> = match &config.authz_file {
            Some(file) => Arc::new(NamespaceAuthzProvider::from_file(
                &root.join(file),
                AccessLevel::Write,
            )?),
            None => Arc::new(AllowAllProvider),
        };
        Self::open_with_authz(root, authz)
    }

    /// Open a repository with an explicit authorization provider.
    pub fn open_with_authz(root: &Path, authz: Arc<dyn AuthzProvider>) -> Result<Self> {
        fs::create_dir_all(root)?;
        let config = RepositoryConfig::load(root)?;
        let recheck = Duration::from_secs(config.recheck_interval_secs);
        let context = Arc::new(RepositoryContext::new(root.to_path_buf(), config));
        let store = Arc::new(FileStore::new(context.clone()));
        let history = HistoryLog::new(store.clone());
        let peers = Arc::new(PeerRegistry::new());
        let availability = Arc::new(AvailabilityChecker::new(
            context.repository_id(),
            recheck,
            peers.clone(),
        ));
        Ok(Self {
            context,
            store,
            history,
            listeners: Mutex::new(Vec::new()),
            peers,
            availability,
            authz,
            item_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Initialize a new repository: persist the configuration, then open.
    pub fn init(root: &Path, config: &RepositoryConfig) -> Result<Self> {
        fs::create_dir_all(root)?;
        config.save(root)?;
        Self::open(root)
    }

    pub fn repository_id(&self) -> &str {
        self.context.repository_id()
    }

    pub fn config(&self) -> &RepositoryConfig {
        self.context.config()
    }

    pub fn availability(&self) -> &Arc<AvailabilityChecker> {
        &self.availability
    }

    pub async fn register_listener(&self, listener: Arc<dyn RepositoryListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn register_peer(&self, peer: Arc<dyn RemoteRepository>) {
        self.peers.register(peer).await;
    }

    // ==================== Lifecycle Operations ====================

    /// Publish new content into a namespace. The target identity must be
    /// unmanaged (no prior metadata) and the user needs WRITE access on
    /// the namespace. The item starts out ManagedUnlocked / Draft.
    pub async fn publish(&self, request: PublishRequest) -> Result<ItemMetadata> {
        if self.authz.check_access(
            Some(&request.user),
            &request.base_namespace,
            AccessLevel::Write,
        ) != AuthzResult::Granted
        {
            return Err(RepositoryError::PermissionDenied {
                user: request.user.clone(),
                namespace: request.base_namespace.clone(),
            });
        }

        let key = request.key();
        let mutex = self.item_mutex(&key).await;
        let _guard = mutex.lock().await;

        if self.store.metadata_exists(&key) {
            return Err(RepositoryError::precondition(format!(
                "item {} is already published",
                key
            )));
        }

        let mut changeset = ChangeSet::begin(format!("publish {}", key));
        let now = Utc::now();
        let result = (|| -> Result<ItemMetadata> {
            self.store
                .ensure_namespace_dir(&mut changeset, &key.base_namespace)?;
            self.store
                .write_content(&mut changeset, &key, &request.content)?;
            let metadata = ItemMetadata {
                base_namespace: key.base_namespace.clone(),
                filename: key.filename.clone(),
                version: key.version.clone(),
                version_scheme: key.version_scheme,
                state: RepositoryItemState::ManagedUnlocked,
                status: LibraryStatus::Draft,
                locked_by: None,
                owning_repository: self.repository_id().to_string(),
                last_updated: now,
                content_digest: store::content_digest(&request.content),
            };
            self.store.write_metadata(&mut changeset, &metadata)?;
            self.history
                .append(&mut changeset, &key, &request.user, now, "Initial publication.")?;
            Ok(metadata)
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user = %request.user, "item published");
        self.notify("publish", |l| l.on_publish(&metadata)).await;
        Ok(metadata)
    }

    /// Lock an item for editing, materializing a work-in-process copy of
    /// its content. Only ManagedUnlocked items with an editable status may
    /// be locked.
    pub async fn lock(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.lock(key, user).await;
        }
        ensure_mutable(&metadata)?;
        if metadata.state != RepositoryItemState::ManagedUnlocked {
            return Err(lock_state_error(&metadata));
        }
        if !metadata.status.is_editable(metadata.version_scheme) {
            return Err(RepositoryError::precondition(format!(
                "item {} has status {} and can no longer be edited",
                key, metadata.status
            )));
        }

        let mut changeset = ChangeSet::begin(format!("lock {}", key));
        let result = (|| -> Result<ItemMetadata> {
            let content = self.store.read_content(key)?;
            self.store.write_wip(&mut changeset, key, &content)?;
            metadata.state = RepositoryItemState::ManagedWip;
            metadata.locked_by = Some(user.to_string());
            metadata.last_updated = Utc::now();
            self.store.write_metadata(&mut changeset, &metadata)?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, "item locked");
        self.notify("lock", |l| l.on_lock(&metadata)).await;
        Ok(metadata)
    }

    /// Commit the work-in-process content into the main store, appending
    /// a history entry with the caller's remarks. The item stays locked.
    pub async fn commit(&self, key: &ItemKey, user: &str, remarks: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.commit(key, user, remarks).await;
        }
        ensure_mutable(&metadata)?;
        ensure_lock_holder(&metadata, user)?;

        let mut changeset = ChangeSet::begin(format!("commit {}", key));
        let result = (|| -> Result<ItemMetadata> {
            self.apply_commit(&mut changeset, &mut metadata, user, remarks)?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, "WIP content committed");
        self.notify("commit", |l| l.on_commit(&metadata, remarks)).await;
        Ok(metadata)
    }

    /// Release the lock. With `commit_wip` the pending content is
    /// committed first (with `remarks` on that embedded commit) but the
    /// embedded commit fires no listener notification of its own: only
    /// `on_unlock` fires, one notification per logical user action.
    pub async fn unlock(
        &self,
        key: &ItemKey,
        user: &str,
        commit_wip: bool,
        remarks: Option<&str>,
    ) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.unlock(key, user, commit_wip, remarks).await;
        }
        ensure_mutable(&metadata)?;
        ensure_lock_holder(&metadata, user)?;

        let mut changeset = ChangeSet::begin(format!("unlock {}", key));
        let result = (|| -> Result<ItemMetadata> {
            if commit_wip {
                self.apply_commit(&mut changeset, &mut metadata, user, remarks.unwrap_or(""))?;
            }
            self.store
                .delete_file(&mut changeset, &self.store.wip_path(key))?;
            metadata.state = RepositoryItemState::ManagedUnlocked;
            metadata.locked_by = None;
            metadata.last_updated = Utc::now();
            self.store.write_metadata(&mut changeset, &metadata)?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, commit_wip, "item unlocked");
        self.notify("unlock", |l| l.on_unlock(&metadata, commit_wip))
            .await;
        Ok(metadata)
    }

    /// Discard pending edits: overwrite the WIP copy with the repository
    /// content. The item stays locked; no history entry, no notification.
    pub async fn revert(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.revert(key, user).await;
        }
        ensure_mutable(&metadata)?;
        if metadata.state != RepositoryItemState::ManagedWip {
            return Err(RepositoryError::precondition(format!(
                "item {} has no work-in-process content to revert",
                key
            )));
        }

        let mut changeset = ChangeSet::begin(format!("revert {}", key));
        let result = (|| -> Result<ItemMetadata> {
            let content = self.store.read_content(key)?;
            self.store.write_wip(&mut changeset, key, &content)?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, "WIP content reverted");
        Ok(metadata)
    }

    /// Advance the item's status one step along its scheme's ladder.
    pub async fn promote(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.promote(key, user).await;
        }
        ensure_mutable(&metadata)?;
        ensure_unlocked(&metadata, "promote")?;
        let original = metadata.status;
        let next = original
            .next_status(metadata.version_scheme)
            .ok_or_else(|| {
                RepositoryError::precondition(format!(
                    "item {} cannot be promoted beyond {}",
                    key, original
                ))
            })?;

        let mut changeset = ChangeSet::begin(format!("promote {}", key));
        let now = Utc::now();
        let result = (|| -> Result<ItemMetadata> {
            metadata.status = next;
            metadata.last_updated = now;
            self.store.write_metadata(&mut changeset, &metadata)?;
            self.history.append(
                &mut changeset,
                key,
                user,
                now,
                &format!("Promoted to {}.", next),
            )?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, status = %next, "item promoted");
        self.notify("promote", |l| l.on_promote(&metadata, original))
            .await;
        Ok(metadata)
    }

    /// Regress the item's status one step along its scheme's ladder.
    pub async fn demote(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.demote(key, user).await;
        }
        ensure_mutable(&metadata)?;
        ensure_unlocked(&metadata, "demote")?;
        let original = metadata.status;
        let previous = original
            .previous_status(metadata.version_scheme)
            .ok_or_else(|| {
                RepositoryError::precondition(format!(
                    "item {} cannot be demoted below {}",
                    key, original
                ))
            })?;

        let mut changeset = ChangeSet::begin(format!("demote {}", key));
        let now = Utc::now();
        let result = (|| -> Result<ItemMetadata> {
            metadata.status = previous;
            metadata.last_updated = now;
            self.store.write_metadata(&mut changeset, &metadata)?;
            self.history.append(
                &mut changeset,
                key,
                user,
                now,
                &format!("Demoted to {}.", previous),
            )?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, status = %previous, "item demoted");
        self.notify("demote", |l| l.on_demote(&metadata, original))
            .await;
        Ok(metadata)
    }

    /// Jump the item's status to an arbitrary value (administrative).
    pub async fn update_status(
        &self,
        key: &ItemKey,
        user: &str,
        new_status: LibraryStatus,
    ) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.update_status(key, user, new_status).await;
        }
        ensure_mutable(&metadata)?;
        ensure_unlocked(&metadata, "update the status of")?;
        let original = metadata.status;

        let mut changeset = ChangeSet::begin(format!("update-status {}", key));
        let result = (|| -> Result<ItemMetadata> {
            metadata.status = new_status;
            metadata.last_updated = Utc::now();
            self.store.write_metadata(&mut changeset, &metadata)?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, from = %original, to = %new_status, "item status updated");
        self.notify("update_status", |l| l.on_update_status(&metadata, original))
            .await;
        Ok(metadata)
    }

    /// Resave the content file and recompute the embedded integrity value.
    /// Not applicable to Draft items, whose content is still in flux.
    pub async fn recalculate_crc(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let mut metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.recalculate_crc(key, user).await;
        }
        ensure_mutable(&metadata)?;
        if metadata.status == LibraryStatus::Draft {
            return Err(RepositoryError::precondition(format!(
                "item {} is still DRAFT; its CRC is not yet frozen",
                key
            )));
        }

        let mut changeset = ChangeSet::begin(format!("recalculate-crc {}", key));
        let now = Utc::now();
        let result = (|| -> Result<ItemMetadata> {
            let content = self.store.read_content(key)?;
            self.store.write_content(&mut changeset, key, &content)?;
            metadata.content_digest = store::content_digest(&content);
            metadata.last_updated = now;
            self.store.write_metadata(&mut changeset, &metadata)?;
            self.history
                .append(&mut changeset, key, user, now, "Recalculated library CRC.")?;
            Ok(metadata.clone())
        })();

        let metadata = self.finish(changeset, result)?;
        tracing::info!(item = %key, user, "library CRC recalculated");
        self.notify("recalculate_crc", |l| l.on_recalculate_crc(&metadata))
            .await;
        Ok(metadata)
    }

    /// Administratively remove an item: content, metadata, WIP copy, and
    /// the entire history with all snapshots.
    pub async fn delete(&self, key: &ItemKey, user: &str) -> Result<()> {
        let mutex = self.item_mutex(key).await;
        let _guard = mutex.lock().await;

        let metadata = self.store.read_metadata(key)?;
        if let Some(peer) = self.remote_for(&metadata).await? {
            return peer.delete(key, user).await;
        }

        let mut changeset = ChangeSet::begin(format!("delete {}", key));
        let result = (|| -> Result<()> {
            self.history.delete(&mut changeset, key)?;
            self.store
                .delete_file(&mut changeset, &self.store.content_path(key))?;
            self.store
                .delete_file(&mut changeset, &self.store.wip_path(key))?;
            self.store
                .delete_file(&mut changeset, &self.store.metadata_path(key))?;
            Ok(())
        })();

        self.finish(changeset, result)?;
        self.store.cleanup_after_delete(key);
        tracing::info!(item = %key, user, "item deleted");
        self.notify("delete", |l| l.on_delete(&metadata)).await;
        Ok(())
    }

    // ==================== Read-Only Surface ====================

    /// Metadata for one item. NotFound when it was never published.
    pub async fn item_metadata(&self, key: &ItemKey) -> Result<ItemMetadata> {
        self.store.read_metadata(key)
    }

    /// Lifecycle state for one item; Unmanaged when no metadata exists.
    pub async fn item_state(&self, key: &ItemKey) -> RepositoryItemState {
        match self.store.read_metadata(key) {
            Ok(metadata) => metadata.state,
            Err(_) => RepositoryItemState::Unmanaged,
        }
    }

    /// Commit history for an item, most-recent-first.
    pub async fn get_history(&self, key: &ItemKey) -> Result<Vec<HistoryEntry>> {
        if let Ok(metadata) = self.store.read_metadata(key) {
            if let Some(peer) = self.remote_for(&metadata).await? {
                return peer.get_history(key).await;
            }
        }
        self.history.get(key)
    }

    /// All versions of one library under a namespace, newest first.
    pub async fn get_version_history(
        &self,
        base_namespace: &str,
        filename: &str,
    ) -> Result<Vec<ItemMetadata>> {
        self.store.list_versions(base_namespace, filename)
    }

    /// All items under a namespace.
    pub async fn list_items(&self, base_namespace: &str) -> Result<Vec<ItemMetadata>> {
        self.store.list_namespace_items(base_namespace)
    }

    /// Current content bytes of an item.
    pub async fn get_content(&self, key: &ItemKey) -> Result<Vec<u8>> {
        self.store.read_content(key)
    }

    /// Location of the work-in-process copy while the item is ManagedWip.
    /// The editing layer reads and writes this file directly.
    pub fn wip_path(&self, key: &ItemKey) -> std::path::PathBuf {
        self.store.wip_path(key)
    }

    /// Frozen content of a specific commit.
    pub async fn historical_content(&self, key: &ItemKey, commit_number: u32) -> Result<Vec<u8>> {
        self.history.historical_content(key, commit_number)
    }

    /// Frozen content as of an effective date.
    pub async fn historical_content_at(
        &self,
        key: &ItemKey,
        effective_date: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        self.history.historical_content_at(key, effective_date)
    }

    // ==================== Internals ====================

    /// Replace the main content with the WIP bytes and append a history
    /// entry. Runs inside the caller's change set; fires no notification
    /// (the caller decides which single event to emit).
    fn apply_commit(
        &self,
        changeset: &mut ChangeSet,
        metadata: &mut ItemMetadata,
        user: &str,
        remarks: &str,
    ) -> Result<()> {
        let key = metadata.key();
        let wip = self.store.read_wip(&key)?;
        self.store.write_content(changeset, &key, &wip)?;
        metadata.content_digest = store::content_digest(&wip);
        metadata.last_updated = Utc::now();
        self.store.write_metadata(changeset, metadata)?;
        self.history
            .append(changeset, &key, user, metadata.last_updated, remarks)?;
        Ok(())
    }

    /// Commit the change set on success, roll it back on failure. The
    /// operation fails if either the mutation sequence or the commit
    /// itself errored.
    fn finish<T>(&self, changeset: ChangeSet, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                changeset.commit()?;
                Ok(value)
            }
            Err(e) => {
                changeset.rollback();
                Err(e)
            }
        }
    }

    /// Resolve the peer for a remotely-owned item, or None for local
    /// items. The peer must be registered and currently available.
    async fn remote_for(&self, metadata: &ItemMetadata) -> Result<Option<Arc<dyn RemoteRepository>>> {
        let owner = &metadata.owning_repository;
        if owner == self.repository_id() {
            return Ok(None);
        }
        let peer = self
            .peers
            .get(owner)
            .await
            .ok_or_else(|| RepositoryError::UnknownRemote(owner.clone()))?;
        if !self.availability.ping_repository(owner).await {
            return Err(RepositoryError::RemoteUnavailable(owner.clone()));
        }
        Ok(Some(peer))
    }

    async fn item_mutex(&self, key: &ItemKey) -> Arc<Mutex<()>> {
        let mut locks = self.item_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Notify every registered listener, logging and swallowing
    /// individual failures so one bad listener cannot block the rest.
    async fn notify<F>(&self, event: &str, callback: F)
    where
        F: Fn(&dyn RepositoryListener) -> anyhow::Result<()>,
    {
        let listeners = self.listeners.lock().await;
        for listener in listeners.iter() {
            if let Err(e) = callback(listener.as_ref()) {
                tracing::warn!(event, "repository listener error (ignored): {}", e);
            }
        }
    }
}

fn ensure_mutable(metadata: &ItemMetadata) -> Result<()> {
    if metadata.state == RepositoryItemState::BuiltIn {
        return Err(RepositoryError::precondition(format!(
            "item {} is built-in and immutable",
            metadata.key()
        )));
    }
    Ok(())
}

fn ensure_unlocked(metadata: &ItemMetadata, action: &str) -> Result<()> {
    if metadata.state != RepositoryItemState::ManagedUnlocked {
        return Err(RepositoryError::precondition(format!(
            "cannot {} item {} while its state is {}",
            action,
            metadata.key(),
            metadata.state
        )));
    }
    Ok(())
}

fn ensure_lock_holder(metadata: &ItemMetadata, user: &str) -> Result<()> {
    if !metadata.is_locked() {
        return Err(RepositoryError::precondition(format!(
            "item {} is not locked",
            metadata.key()
        )));
    }
    match metadata.locked_by.as_deref() {
        Some(holder) if holder == user => Ok(()),
        Some(holder) => Err(RepositoryError::precondition(format!(
            "item {} is locked by '{}', not '{}'",
            metadata.key(),
            holder,
            user
        ))),
        None => Err(RepositoryError::precondition(format!(
            "item {} is locked but has no recorded lock holder",
            metadata.key()
        ))),
    }
}

fn lock_state_error(metadata: &ItemMetadata) -> RepositoryError {
    match metadata.locked_by.as_deref() {
        Some(holder) => RepositoryError::precondition(format!(
            "item {} is already locked by '{}'",
            metadata.key(),
            holder
        )),
        None => RepositoryError::precondition(format!(
            "item {} cannot be locked while its state is {}",
            metadata.key(),
            metadata.state
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthzResult;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> RepositoryManager {
        RepositoryManager::open(tmp.path()).unwrap()
    }

    fn invoice_request() -> PublishRequest {
        PublishRequest {
            base_namespace: "http://acme.com/schemas".to_string(),
            filename: "Invoice.otm".to_string(),
            version: "1.0.0".to_string(),
            version_scheme: VersionScheme::Classic,
            content: b"<invoice/>".to_vec(),
            user: "alice".to_string(),
        }
    }

    async fn publish_invoice(mgr: &RepositoryManager) -> ItemKey {
        let request = invoice_request();
        let key = request.key();
        mgr.publish(request).await.unwrap();
        key
    }

    #[tokio::test]
    async fn test_publish_creates_unlocked_draft() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        let metadata = mgr.item_metadata(&key).await.unwrap();
        assert_eq!(metadata.state, RepositoryItemState::ManagedUnlocked);
        assert_eq!(metadata.status, LibraryStatus::Draft);
        assert_eq!(metadata.locked_by, None);
        assert_eq!(metadata.owning_repository, "local");
        assert_eq!(mgr.get_content(&key).await.unwrap(), b"<invoice/>");

        let history = mgr.get_history(&key).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].commit_number, 0);
        assert_eq!(history[0].remarks, "Initial publication.");
    }

    #[tokio::test]
    async fn test_duplicate_publish_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        publish_invoice(&mgr).await;

        let result = mgr.publish(invoice_request()).await;
        assert!(matches!(result, Err(RepositoryError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_publish_requires_write_access() {
        struct DenyAll;
        impl AuthzProvider for DenyAll {
            fn check_access(&self, _u: Option<&str>, _ns: &str, _l: AccessLevel) -> AuthzResult {
                AuthzResult::Denied
            }
        }

        let tmp = TempDir::new().unwrap();
        let mgr = RepositoryManager::open_with_authz(tmp.path(), Arc::new(DenyAll)).unwrap();
        let request = invoice_request();
        let key = request.key();

        let result = mgr.publish(request).await;
        assert!(matches!(result, Err(RepositoryError::PermissionDenied { .. })));
        // Nothing was written.
        assert_eq!(mgr.item_state(&key).await, RepositoryItemState::Unmanaged);
    }

    #[tokio::test]
    async fn test_publish_lock_edit_unlock_scenario() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.lock(&key, "alice").await.unwrap();
        let metadata = mgr.item_metadata(&key).await.unwrap();
        assert_eq!(metadata.state, RepositoryItemState::ManagedWip);
        assert_eq!(metadata.locked_by.as_deref(), Some("alice"));
        assert!(mgr.wip_path(&key).exists());

        fs::write(mgr.wip_path(&key), b"X").unwrap();
        let metadata = mgr
            .unlock(&key, "alice", true, Some("fix typo"))
            .await
            .unwrap();

        assert_eq!(metadata.state, RepositoryItemState::ManagedUnlocked);
        assert_eq!(metadata.locked_by, None);
        assert!(!mgr.wip_path(&key).exists());
        assert_eq!(mgr.get_content(&key).await.unwrap(), b"X");

        let history = mgr.get_history(&key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].commit_number, 1);
        assert_eq!(history[0].remarks, "fix typo");
        assert_eq!(history[1].commit_number, 0);
    }

    #[tokio::test]
    async fn test_unlock_without_commit_discards_wip() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.lock(&key, "alice").await.unwrap();
        fs::write(mgr.wip_path(&key), b"abandoned edits").unwrap();
        mgr.unlock(&key, "alice", false, None).await.unwrap();

        assert_eq!(mgr.get_content(&key).await.unwrap(), b"<invoice/>");
        assert!(!mgr.wip_path(&key).exists());
        assert_eq!(mgr.get_history(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_restores_repository_copy() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.lock(&key, "alice").await.unwrap();
        fs::write(mgr.wip_path(&key), b"bad edits").unwrap();
        mgr.revert(&key, "alice").await.unwrap();

        assert_eq!(fs::read(mgr.wip_path(&key)).unwrap(), b"<invoice/>");
        // Still locked, still WIP.
        let metadata = mgr.item_metadata(&key).await.unwrap();
        assert_eq!(metadata.state, RepositoryItemState::ManagedWip);
    }

    #[tokio::test]
    async fn test_commit_requires_lock_holder() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        // Not locked at all.
        let result = mgr.commit(&key, "alice", "nope").await;
        assert!(matches!(result, Err(RepositoryError::PreconditionFailed(_))));

        mgr.lock(&key, "alice").await.unwrap();
        let result = mgr.commit(&key, "bob", "not mine").await;
        assert!(matches!(result, Err(RepositoryError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_second_lock_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.lock(&key, "alice").await.unwrap();
        let result = mgr.lock(&key, "bob").await;
        assert!(matches!(result, Err(RepositoryError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_final_item_cannot_be_locked() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.promote(&key, "alice").await.unwrap(); // DRAFT -> FINAL (classic)
        let result = mgr.lock(&key, "alice").await;
        assert!(matches!(result, Err(RepositoryError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_classic_promote_demote_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        let metadata = mgr.promote(&key, "alice").await.unwrap();
        assert_eq!(metadata.status, LibraryStatus::Final);
        let metadata = mgr.demote(&key, "alice").await.unwrap();
        assert_eq!(metadata.status, LibraryStatus::Draft);

        // Boundaries fail with precondition errors.
        assert!(matches!(
            mgr.demote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
        mgr.promote(&key, "alice").await.unwrap();
        assert!(matches!(
            mgr.promote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));

        let history = mgr.get_history(&key).await.unwrap();
        let remarks: Vec<&str> = history.iter().map(|e| e.remarks.as_str()).collect();
        assert_eq!(
            remarks,
            vec![
                "Promoted to FINAL.",
                "Demoted to DRAFT.",
                "Promoted to FINAL.",
                "Initial publication.",
            ]
        );
    }

    #[tokio::test]
    async fn test_extended_ladder_walk() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut request = invoice_request();
        request.version_scheme = VersionScheme::Extended;
        let key = request.key();
        mgr.publish(request).await.unwrap();

        for expected in [LibraryStatus::Review, LibraryStatus::Final, LibraryStatus::Obsolete] {
            let metadata = mgr.promote(&key, "alice").await.unwrap();
            assert_eq!(metadata.status, expected);
        }
        assert!(matches!(
            mgr.promote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));

        let metadata = mgr.demote(&key, "alice").await.unwrap();
        assert_eq!(metadata.status, LibraryStatus::Final);
    }

    #[tokio::test]
    async fn test_status_operations_require_unlocked_state() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;
        mgr.lock(&key, "alice").await.unwrap();

        assert!(matches!(
            mgr.promote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
        assert!(matches!(
            mgr.demote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
        assert!(matches!(
            mgr.update_status(&key, "alice", LibraryStatus::Final).await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
        // Status unchanged by the failed attempts.
        assert_eq!(
            mgr.item_metadata(&key).await.unwrap().status,
            LibraryStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_update_status_arbitrary_jump() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut request = invoice_request();
        request.version_scheme = VersionScheme::Extended;
        let key = request.key();
        mgr.publish(request).await.unwrap();

        let metadata = mgr
            .update_status(&key, "alice", LibraryStatus::Obsolete)
            .await
            .unwrap();
        assert_eq!(metadata.status, LibraryStatus::Obsolete);
        // No history entry for a status jump.
        assert_eq!(mgr.get_history(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recalculate_crc() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        // Draft content is still in flux.
        assert!(matches!(
            mgr.recalculate_crc(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));

        mgr.promote(&key, "alice").await.unwrap();
        let before = mgr.item_metadata(&key).await.unwrap();
        let metadata = mgr.recalculate_crc(&key, "alice").await.unwrap();
        assert_eq!(metadata.content_digest, before.content_digest);
        assert!(metadata.last_updated >= before.last_updated);

        let history = mgr.get_history(&key).await.unwrap();
        assert_eq!(history[0].remarks, "Recalculated library CRC.");
    }

    #[tokio::test]
    async fn test_delete_purges_everything() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        // Build up three history entries.
        for remark in ["second", "third"] {
            mgr.lock(&key, "alice").await.unwrap();
            fs::write(mgr.wip_path(&key), remark.as_bytes()).unwrap();
            mgr.unlock(&key, "alice", true, Some(remark)).await.unwrap();
        }
        assert_eq!(mgr.get_history(&key).await.unwrap().len(), 3);
        let history_dir = mgr.store.history_dir(&key);

        mgr.delete(&key, "admin").await.unwrap();

        assert!(matches!(
            mgr.get_history(&key).await,
            Err(RepositoryError::NotFound(_))
        ));
        assert_eq!(mgr.item_state(&key).await, RepositoryItemState::Unmanaged);
        assert!(!history_dir.exists());
    }

    #[tokio::test]
    async fn test_failed_operation_leaves_disk_untouched() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        let metadata_before = fs::read(mgr.store.metadata_path(&key)).unwrap();
        let content_before = fs::read(mgr.store.content_path(&key)).unwrap();

        // Corrupt the history document so the append inside promote fails
        // after the metadata write has already been staged and applied.
        fs::write(mgr.store.history_doc_path(&key), b"{corrupt").unwrap();

        let result = mgr.promote(&key, "alice").await;
        assert!(matches!(result, Err(RepositoryError::Corrupt { .. })));

        // Rollback restored the staged files byte-for-byte.
        assert_eq!(fs::read(mgr.store.metadata_path(&key)).unwrap(), metadata_before);
        assert_eq!(fs::read(mgr.store.content_path(&key)).unwrap(), content_before);
        assert_eq!(
            mgr.item_metadata(&key).await.unwrap().status,
            LibraryStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_unlock_with_missing_wip_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        mgr.lock(&key, "alice").await.unwrap();
        fs::remove_file(mgr.wip_path(&key)).unwrap();

        let result = mgr.unlock(&key, "alice", true, Some("gone")).await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));

        // Prior state intact: still locked, content unchanged.
        let metadata = mgr.item_metadata(&key).await.unwrap();
        assert_eq!(metadata.state, RepositoryItemState::ManagedWip);
        assert_eq!(mgr.get_content(&key).await.unwrap(), b"<invoice/>");
    }

    #[tokio::test]
    async fn test_wip_file_tracks_wip_state() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        assert!(!mgr.wip_path(&key).exists());
        mgr.lock(&key, "alice").await.unwrap();
        assert!(mgr.wip_path(&key).exists());
        assert_eq!(
            mgr.item_metadata(&key).await.unwrap().state,
            RepositoryItemState::ManagedWip
        );
        mgr.unlock(&key, "alice", false, None).await.unwrap();
        assert!(!mgr.wip_path(&key).exists());
        assert_eq!(
            mgr.item_metadata(&key).await.unwrap().state,
            RepositoryItemState::ManagedUnlocked
        );
    }

    #[tokio::test]
    async fn test_built_in_items_are_immutable() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let key = publish_invoice(&mgr).await;

        let mut metadata = mgr.item_metadata(&key).await.unwrap();
        metadata.state = RepositoryItemState::BuiltIn;
        let mut cs = ChangeSet::begin("test-builtin");
        mgr.store.write_metadata(&mut cs, &metadata).unwrap();
        cs.commit().unwrap();

        assert!(matches!(
            mgr.lock(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
        assert!(matches!(
            mgr.promote(&key, "alice").await,
            Err(RepositoryError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_version_history_newest_first() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        for version in ["1.0.0", "1.10.0", "1.2.0"] {
            let mut request = invoice_request();
            request.version = version.to_string();
            mgr.publish(request).await.unwrap();
        }

        let versions = mgr
            .get_version_history("http://acme.com/schemas", "Invoice.otm")
            .await
            .unwrap_or_default();
        let labels: Vec<&str> = versions.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(labels, vec!["1.10.0", "1.2.0", "1.0.0"]);
    }

    // ==================== Listener Notification ====================

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn record(&self, event: &str) {
            self.events
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(event.to_string());
        }

        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        }
    }

    impl RepositoryListener for RecordingListener {
        fn on_publish(&self, _item: &ItemMetadata) -> anyhow::Result<()> {
            self.record("publish");
            Ok(())
        }
        fn on_lock(&self, _item: &ItemMetadata) -> anyhow::Result<()> {
            self.record("lock");
            Ok(())
        }
        fn on_unlock(&self, _item: &ItemMetadata, _committed: bool) -> anyhow::Result<()> {
            self.record("unlock");
            Ok(())
        }
        fn on_commit(&self, _item: &ItemMetadata, _remarks: &str) -> anyhow::Result<()> {
            self.record("commit");
            Ok(())
        }
        fn on_delete(&self, _item: &ItemMetadata) -> anyhow::Result<()> {
            self.record("delete");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unlock_with_commit_fires_single_notification() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let listener = Arc::new(RecordingListener::default());
        mgr.register_listener(listener.clone()).await;

        let key = publish_invoice(&mgr).await;
        mgr.lock(&key, "alice").await.unwrap();
        fs::write(mgr.wip_path(&key), b"edited").unwrap();
        mgr.unlock(&key, "alice", true, Some("done")).await.unwrap();

        // The embedded commit is silent; only on_unlock fires.
        assert_eq!(listener.events(), vec!["publish", "lock", "unlock"]);
    }

    #[tokio::test]
    async fn test_standalone_commit_fires_commit_notification() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let listener = Arc::new(RecordingListener::default());
        mgr.register_listener(listener.clone()).await;

        let key = publish_invoice(&mgr).await;
        mgr.lock(&key, "alice").await.unwrap();
        fs::write(mgr.wip_path(&key), b"edited").unwrap();
        mgr.commit(&key, "alice", "standalone").await.unwrap();

        assert_eq!(listener.events(), vec!["publish", "lock", "commit"]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        struct FailingListener;
        impl RepositoryListener for FailingListener {
            fn on_publish(&self, _item: &ItemMetadata) -> anyhow::Result<()> {
                anyhow::bail!("listener exploded")
            }
        }

        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let recorder = Arc::new(RecordingListener::default());
        mgr.register_listener(Arc::new(FailingListener)).await;
        mgr.register_listener(recorder.clone()).await;

        let key = publish_invoice(&mgr).await;

        // The publish committed and the second listener still ran.
        assert_eq!(mgr.item_state(&key).await, RepositoryItemState::ManagedUnlocked);
        assert_eq!(recorder.events(), vec!["publish"]);
    }

    // ==================== Remote Delegation ====================

    struct RecordingPeer {
        id: String,
        healthy: bool,
        calls: StdMutex<Vec<String>>,
        canned: ItemMetadata,
    }

    impl RecordingPeer {
        fn new(id: &str, healthy: bool, canned: ItemMetadata) -> Self {
            Self {
                id: id.to_string(),
                healthy,
                calls: StdMutex::new(Vec::new()),
                canned,
            }
        }

        fn record(&self, call: &str) {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    #[async_trait]
    impl RemoteRepository for RecordingPeer {
        fn id(&self) -> &str {
            &self.id
        }
        async fn ping(&self) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(RepositoryError::RemoteUnavailable(self.id.clone()))
            }
        }
        async fn publish(&self, _request: PublishRequest) -> Result<ItemMetadata> {
            self.record("publish");
            Ok(self.canned.clone())
        }
        async fn lock(&self, _key: &ItemKey, _user: &str) -> Result<ItemMetadata> {
            self.record("lock");
            Ok(self.canned.clone())
        }
        async fn unlock(
            &self,
            _key: &ItemKey,
            _user: &str,
            _commit_wip: bool,
            _remarks: Option<&str>,
        ) -> Result<ItemMetadata> {
            self.record("unlock");
            Ok(self.canned.clone())
        }
        async fn commit(&self, _key: &ItemKey, _user: &str, _remarks: &str) -> Result<ItemMetadata> {
            self.record("commit");
            Ok(self.canned.clone())
        }
        async fn revert(&self, _key: &ItemKey, _user: &str) -> Result<ItemMetadata> {
            self.record("revert");
            Ok(self.canned.clone())
        }
        async fn promote(&self, _key: &ItemKey, _user: &str) -> Result<ItemMetadata> {
            self.record("promote");
            Ok(self.canned.clone())
        }
        async fn demote(&self, _key: &ItemKey, _user: &str) -> Result<ItemMetadata> {
            self.record("demote");
            Ok(self.canned.clone())
        }
        async fn update_status(
            &self,
            _key: &ItemKey,
            _user: &str,
            _new_status: LibraryStatus,
        ) -> Result<ItemMetadata> {
            self.record("update_status");
            Ok(self.canned.clone())
        }
        async fn recalculate_crc(&self, _key: &ItemKey, _user: &str) -> Result<ItemMetadata> {
            self.record("recalculate_crc");
            Ok(self.canned.clone())
        }
        async fn delete(&self, _key: &ItemKey, _user: &str) -> Result<()> {
            self.record("delete");
            Ok(())
        }
        async fn get_history(&self, _key: &ItemKey) -> Result<Vec<HistoryEntry>> {
            self.record("get_history");
            Ok(Vec::new())
        }
    }

    /// Publish locally, then rewrite the metadata so the item appears to
    /// be owned by another repository.
    async fn publish_remote_owned(mgr: &RepositoryManager, owner: &str) -> (ItemKey, ItemMetadata) {
        let key = publish_invoice(mgr).await;
        let mut metadata = mgr.item_metadata(&key).await.unwrap();
        metadata.owning_repository = owner.to_string();
        let mut cs = ChangeSet::begin("test-reown");
        mgr.store.write_metadata(&mut cs, &metadata).unwrap();
        cs.commit().unwrap();
        (key, metadata)
    }

    #[tokio::test]
    async fn test_remote_item_operations_are_forwarded() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (key, metadata) = publish_remote_owned(&mgr, "remote-a").await;

        let peer = Arc::new(RecordingPeer::new("remote-a", true, metadata));
        mgr.register_peer(peer.clone()).await;

        mgr.lock(&key, "alice").await.unwrap();
        mgr.promote(&key, "alice").await.unwrap();
        mgr.get_history(&key).await.unwrap();
        assert_eq!(peer.calls(), vec!["lock", "promote", "get_history"]);

        // No local mutation happened: the local copy is still unlocked.
        assert!(!mgr.wip_path(&key).exists());
    }

    #[tokio::test]
    async fn test_unavailable_remote_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (key, metadata) = publish_remote_owned(&mgr, "remote-b").await;

        let peer = Arc::new(RecordingPeer::new("remote-b", false, metadata));
        mgr.register_peer(peer.clone()).await;

        let result = mgr.lock(&key, "alice").await;
        assert!(matches!(result, Err(RepositoryError::RemoteUnavailable(_))));
        assert!(peer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_remote_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let (key, _metadata) = publish_remote_owned(&mgr, "remote-unknown").await;

        let result = mgr.promote(&key, "alice").await;
        assert!(matches!(result, Err(RepositoryError::UnknownRemote(_))));
    }
}
