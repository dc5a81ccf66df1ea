//! Cached availability probing of remote peers
//!
//! The lifecycle engine asks the checker before delegating an operation
//! to a remote repository. A successful probe is cached for the recheck
//! interval; probes for the same id are serialized so a burst of callers
//! cannot cause a probe storm. The local repository is always reported
//! available without a network round-trip.

use crate::remote::PeerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Upper bound on concurrently running probes during fan-out.
pub const MAX_CONCURRENT_PROBES: usize = 8;

/// Cached, serialized availability probe over the peer registry
pub struct AvailabilityChecker {
    inner: Arc<CheckerInner>,
}

struct CheckerInner {
    local_id: String,
    recheck_interval: Duration,
    peers: Arc<PeerRegistry>,
    /// repository id -> time of the last successful probe
    last_success: Mutex<HashMap<String, Instant>>,
    /// per-id probe serialization
    probe_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AvailabilityChecker {
    pub fn new(local_id: impl Into<String>, recheck_interval: Duration, peers: Arc<PeerRegistry>) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                local_id: local_id.into(),
                recheck_interval,
                peers,
                last_success: Mutex::new(HashMap::new()),
                probe_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether the repository is currently reachable. Returns the cached
    /// answer when a successful probe happened within the recheck
    /// interval; otherwise probes synchronously. A probe failure purges
    /// the cache entry so the next call re-probes immediately.
    pub async fn ping_repository(&self, id: &str) -> bool {
        self.inner.ping(id).await
    }

    /// Probe every id concurrently (bounded fan-out) and aggregate:
    /// all-available when `fail_on_single_failure`, any-available
    /// otherwise.
    pub async fn ping_all_repositories(
        &self,
        ids: &[String],
        fail_on_single_failure: bool,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut probes = JoinSet::new();
        for id in ids {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let id = id.clone();
            probes.spawn(async move {
                let _permit = semaphore.acquire().await;
                inner.ping(&id).await
            });
        }

        let mut results = Vec::with_capacity(ids.len());
        while let Some(joined) = probes.join_next().await {
            results.push(joined.unwrap_or(false));
        }

        if fail_on_single_failure {
            results.iter().all(|&ok| ok)
        } else {
            results.iter().any(|&ok| ok)
        }
    }

    /// Drop every cached probe result.
    pub async fn clear_cache(&self) {
        self.inner.last_success.lock().await.clear();
    }
}

impl CheckerInner {
    async fn ping(&self, id: &str) -> bool {
        if id == self.local_id {
            return true;
        }
        if self.is_cached(id).await {
            return true;
        }

        let probe_lock = self.probe_lock(id).await;
        let _guard = probe_lock.lock().await;

        // Another caller may have finished the probe while we waited.
        if self.is_cached(id).await {
            return true;
        }

        let available = match self.peers.get(id).await {
            Some(peer) => match peer.ping().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(repository = id, "availability probe failed: {}", e);
                    false
                }
            },
            None => {
                tracing::warn!(repository = id, "availability probe for unregistered peer");
                false
            }
        };

        let mut cache = self.last_success.lock().await;
        if available {
            cache.insert(id.to_string(), Instant::now());
        } else {
            cache.remove(id);
        }
        available
    }

    async fn is_cached(&self, id: &str) -> bool {
        let cache = self.last_success.lock().await;
        cache
            .get(id)
            .map(|at| at.elapsed() < self.recheck_interval)
            .unwrap_or(false)
    }

    async fn probe_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.probe_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
