//! Decision cache: TTL'd permission snapshots and decision results with
//! single-flight computation and synchronous invalidation.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::Decision;
use crate::services::error::ServiceError;

/// Shared, immutable snapshot of a principal's effective permissions.
pub type PermSet = Arc<HashSet<String>>;

#[derive(Clone)]
struct PermEntry {
    value: PermSet,
    expires_at: Instant,
}

#[derive(Clone)]
struct DecisionEntry {
    decision: Decision,
    expires_at: Instant,
}

#[derive(Clone)]
enum ComputeState {
    Pending,
    Done(Result<PermSet, String>),
}

pub struct DecisionCache {
    perms: DashMap<Uuid, PermEntry>,
    decisions: DashMap<String, DecisionEntry>,
    inflight: DashMap<Uuid, watch::Receiver<ComputeState>>,
    /// Bumped on invalidation so a stale in-flight computation cannot
    /// re-install an old snapshot after its principal was invalidated.
    epochs: DashMap<Uuid, u64>,
    perm_ttl: Duration,
}

/// Removes the in-flight marker on every exit path of the winning
/// computation, including cancellation.
struct InflightGuard<'a> {
    cache: &'a DecisionCache,
    key: Uuid,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache.inflight.remove(&self.key);
    }
}

impl DecisionCache {
    pub fn new(perm_ttl: Duration) -> Self {
        Self {
            perms: DashMap::new(),
            decisions: DashMap::new(),
            inflight: DashMap::new(),
            epochs: DashMap::new(),
            perm_ttl,
        }
    }

    fn epoch(&self, principal: Uuid) -> u64 {
        self.epochs.get(&principal).map(|e| *e).unwrap_or(0)
    }

    /// Fresh (unexpired) permission snapshot, if cached.
    pub fn get_perms(&self, principal: Uuid) -> Option<PermSet> {
        let entry = self.perms.get(&principal)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.perms.remove(&principal);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Fetch the cached snapshot or compute it, coalescing concurrent
    /// callers for the same principal into one computation.
    pub async fn get_or_compute_perms<F, Fut>(
        &self,
        principal: Uuid,
        compute: F,
    ) -> Result<PermSet, ServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HashSet<String>, ServiceError>>,
    {
        loop {
            if let Some(cached) = self.get_perms(principal) {
                return Ok(cached);
            }

            enum Role {
                Winner(watch::Sender<ComputeState>),
                Loser(watch::Receiver<ComputeState>),
            }

            let role = match self.inflight.entry(principal) {
                Entry::Occupied(entry) => Role::Loser(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(ComputeState::Pending);
                    entry.insert(rx);
                    Role::Winner(tx)
                }
            };

            match role {
                Role::Winner(tx) => {
                    let _guard = InflightGuard {
                        cache: self,
                        key: principal,
                    };
                    let epoch = self.epoch(principal);
                    let result = compute().await.map(Arc::new);
                    if let Ok(set) = &result {
                        // A concurrent invalidation outranks this snapshot.
                        if self.epoch(principal) == epoch {
                            self.perms.insert(
                                principal,
                                PermEntry {
                                    value: set.clone(),
                                    expires_at: Instant::now() + self.perm_ttl,
                                },
                            );
                        }
                    }
                    let shared = result
                        .as_ref()
                        .map(Arc::clone)
                        .map_err(|e| e.to_string());
                    let _ = tx.send(ComputeState::Done(shared));
                    return result;
                }
                Role::Loser(mut rx) => {
                    let outcome = loop {
                        let state = rx.borrow().clone();
                        if let ComputeState::Done(res) = state {
                            break Some(res);
                        }
                        if rx.changed().await.is_err() {
                            // Winner dropped without finishing; retry.
                            break None;
                        }
                    };
                    match outcome {
                        Some(Ok(set)) => return Ok(set),
                        Some(Err(msg)) => return Err(ServiceError::Internal(anyhow::anyhow!(msg))),
                        None => continue,
                    }
                }
            }
        }
    }

    fn decision_key(principal: Uuid, resource_type: &str, resource_id: &str, action: &str) -> String {
        format!("dec:{}:{}:{}:{}", principal, resource_type, resource_id, action)
    }

    pub fn get_decision(
        &self,
        principal: Uuid,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> Option<Decision> {
        let key = Self::decision_key(principal, resource_type, resource_id, action);
        let entry = self.decisions.get(&key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.decisions.remove(&key);
            return None;
        }
        Some(entry.decision.clone())
    }

    pub fn put_decision(
        &self,
        principal: Uuid,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        decision: Decision,
    ) {
        let key = Self::decision_key(principal, resource_type, resource_id, action);
        self.decisions.insert(
            key,
            DecisionEntry {
                decision,
                // Decision entries inherit the permission TTL.
                expires_at: Instant::now() + self.perm_ttl,
            },
        );
    }

    /// Drop every cached snapshot and decision for the given principals.
    /// Runs synchronously; callers must invoke it before acknowledging
    /// the write that made the cache stale.
    pub fn invalidate(&self, principals: &[Uuid]) {
        for principal in principals {
            self.epochs
                .entry(*principal)
                .and_modify(|e| *e += 1)
                .or_insert(1);
            self.perms.remove(principal);
            let prefix = format!("dec:{}:", principal);
            self.decisions.retain(|key, _| !key.starts_with(&prefix));
        }
    }

    /// Drop every cached snapshot and decision. Used when a catalog-level
    /// write can reach principals that cannot be enumerated cheaply
    /// (e.g. through group inheritance).
    pub fn invalidate_all(&self) {
        for mut entry in self.epochs.iter_mut() {
            *entry += 1;
        }
        self.perms.clear();
        self.decisions.clear();
    }

    /// Remove expired entries. Driven by a single timer task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.perms.retain(|_, entry| entry.expires_at > now);
        self.decisions.retain(|_, entry| entry.expires_at > now);
    }

    /// Spawn the sweeper; one per cache.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
        })
    }

    #[cfg(test)]
    fn len_perms(&self) -> usize {
        self.perms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set_of(perms: &[&str]) -> HashSet<String> {
        perms.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_computation() {
        let cache = Arc::new(DecisionCache::new(Duration::from_secs(60)));
        let computations = Arc::new(AtomicUsize::new(0));
        let principal = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let computations = computations.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute_perms(principal, || {
                        let computations = computations.clone();
                        async move {
                            computations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(set_of(&["doc:read"]))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let set = handle.await.unwrap().unwrap();
            assert!(set.contains("doc:read"));
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let cache = DecisionCache::new(Duration::from_millis(10));
        let principal = Uuid::new_v4();

        cache
            .get_or_compute_perms(principal, || async { Ok(set_of(&["a:b"])) })
            .await
            .unwrap();
        assert!(cache.get_perms(principal).is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get_perms(principal).is_none());
    }

    #[tokio::test]
    async fn invalidation_clears_perms_and_decisions() {
        let cache = DecisionCache::new(Duration::from_secs(60));
        let principal = Uuid::new_v4();
        let other = Uuid::new_v4();

        cache
            .get_or_compute_perms(principal, || async { Ok(set_of(&["a:b"])) })
            .await
            .unwrap();
        cache.put_decision(principal, "doc", "d1", "read", Decision::allow("matched:a:b"));
        cache.put_decision(other, "doc", "d1", "read", Decision::allow("matched:a:b"));

        cache.invalidate(&[principal]);

        assert!(cache.get_perms(principal).is_none());
        assert!(cache.get_decision(principal, "doc", "d1", "read").is_none());
        assert!(cache.get_decision(other, "doc", "d1", "read").is_some());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache = DecisionCache::new(Duration::from_millis(5));
        let principal = Uuid::new_v4();
        cache
            .get_or_compute_perms(principal, || async { Ok(set_of(&["a:b"])) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.sweep();
        assert_eq!(cache.len_perms(), 0);
    }

    #[tokio::test]
    async fn losers_receive_the_winners_error() {
        let cache = Arc::new(DecisionCache::new(Duration::from_secs(60)));
        let principal = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute_perms(principal, || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(ServiceError::Internal(anyhow::anyhow!("backing store down")))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
    }
}
