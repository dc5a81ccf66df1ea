//! Remote repository capability
//!
//! Non-local items are delegated to the repository that owns them through
//! the [`RemoteRepository`] trait. The transport behind the trait (HTTP
//! client, test double, in-process peer) is outside this crate; the
//! lifecycle engine only sees the capability surface.

use crate::error::Result;
use crate::history::HistoryEntry;
use crate::item::{ItemKey, ItemMetadata, LibraryStatus};
use crate::manager::PublishRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque capability for a remote repository peer.
///
/// Every forwarded operation mirrors the local lifecycle surface; the
/// local change-set and history machinery is never involved.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Identifier of the remote repository instance.
    fn id(&self) -> &str;

    /// Cheap reachability probe. An error counts as unavailable.
    async fn ping(&self) -> Result<()>;

    async fn publish(&self, request: PublishRequest) -> Result<ItemMetadata>;

    async fn lock(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata>;

    async fn unlock(
        &self,
        key: &ItemKey,
        user: &str,
        commit_wip: bool,
        remarks: Option<&str>,
    ) -> Result<ItemMetadata>;

    async fn commit(&self, key: &ItemKey, user: &str, remarks: &str) -> Result<ItemMetadata>;

    async fn revert(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata>;

    async fn promote(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata>;

    async fn demote(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata>;

    async fn update_status(
        &self,
        key: &ItemKey,
        user: &str,
        new_status: LibraryStatus,
    ) -> Result<ItemMetadata>;

    async fn recalculate_crc(&self, key: &ItemKey, user: &str) -> Result<ItemMetadata>;

    async fn delete(&self, key: &ItemKey, user: &str) -> Result<()>;

    async fn get_history(&self, key: &ItemKey) -> Result<Vec<HistoryEntry>>;
}

/// Registry of known remote peers, keyed by repository id
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<dyn RemoteRepository>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a peer under its own id.
    pub async fn register(&self, peer: Arc<dyn RemoteRepository>) {
        let id = peer.id().to_string();
        let mut peers = self.peers.write().await;
        peers.insert(id, peer);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn RemoteRepository>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        peers.keys().cloned().collect()
    }
}
