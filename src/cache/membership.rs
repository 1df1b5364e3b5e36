use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;

use super::Cache;
use crate::errors::GraphResult;
use crate::models::ParentReference;
use crate::traversal::TraversalService;

/// A user's full ancestor set, shared read-only between readers.
pub type EffectiveGroups = Arc<Vec<ParentReference>>;

/// Lazily populated `(user, partition) -> effective groups` cache.
///
/// Mutations call `invalidate_all` with their affected users; the TTL only
/// bounds how long an entry can outlive a missed invalidation. A key that has
/// a load in flight carries a generation counter, so a load that raced with
/// an invalidation is never left behind in the cache. The counter is dropped
/// with the last load for that key.
pub struct MembershipCache {
    cache: Arc<dyn Cache<EffectiveGroups>>,
    traversal: TraversalService,
    ttl: Duration,
    in_flight: Mutex<HashMap<String, LoadState>>,
}

#[derive(Debug, Default)]
struct LoadState {
    generation: u64,
    loads: usize,
}

/// Releases a key's load slot even when the load future is dropped.
struct LoadGuard<'a> {
    owner: &'a MembershipCache,
    key: &'a str,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.owner.lock_in_flight();
        if let Some(state) = in_flight.get_mut(self.key) {
            state.loads -= 1;
            if state.loads == 0 {
                in_flight.remove(self.key);
            }
        }
    }
}

impl MembershipCache {
    pub fn new(cache: Arc<dyn Cache<EffectiveGroups>>, traversal: TraversalService, ttl: Duration) -> Self {
        Self {
            cache,
            traversal,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(user_id: &str, partition_id: &str) -> String {
        format!("{partition_id}/{user_id}")
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, LoadState>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_load<'a>(&'a self, key: &'a str) -> (u64, LoadGuard<'a>) {
        let mut in_flight = self.lock_in_flight();
        let state = in_flight.entry(key.to_string()).or_default();
        state.loads += 1;
        (state.generation, LoadGuard { owner: self, key })
    }

    fn generation(&self, key: &str) -> u64 {
        self.lock_in_flight().get(key).map(|state| state.generation).unwrap_or(0)
    }

    // Without a load in flight there is nothing to guard.
    fn bump_generation(&self, key: &str) {
        if let Some(state) = self.lock_in_flight().get_mut(key) {
            state.generation += 1;
        }
    }

    /// Cached ancestor set of `user_id`, computing and storing it on a miss.
    pub async fn effective_groups(&self, user_id: &str, partition_id: &str) -> GraphResult<EffectiveGroups> {
        let key = Self::key(user_id, partition_id);
        if let Some(groups) = self.cache.get(&key).await {
            tracing::trace!(user_id = %user_id, partition_id = %partition_id, "membership cache hit");
            return Ok(groups);
        }

        let (generation, _load) = self.begin_load(&key);
        let groups: EffectiveGroups = Arc::new(self.traversal.all_ancestors(user_id, partition_id).await?);

        if self.generation(&key) == generation {
            self.cache.put(&key, groups.clone(), self.ttl).await;
            // An invalidation may have slipped in between the check and the put.
            if self.generation(&key) != generation {
                self.cache.delete(&key).await;
            }
        } else {
            tracing::debug!(
                user_id = %user_id,
                partition_id = %partition_id,
                "membership changed during load, result not cached"
            );
        }

        Ok(groups)
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub async fn invalidate(&self, user_id: &str, partition_id: &str) {
        let key = Self::key(user_id, partition_id);
        self.bump_generation(&key);
        self.cache.delete(&key).await;
    }

    /// Invalidate many users concurrently. Deletes are idempotent and
    /// independent; a failed task is logged and otherwise ignored.
    pub async fn invalidate_all(&self, user_ids: &BTreeSet<String>, partition_id: &str) {
        if user_ids.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for user_id in user_ids {
            let key = Self::key(user_id, partition_id);
            self.bump_generation(&key);
            let cache = Arc::clone(&self.cache);
            tasks.spawn(async move { cache.delete(&key).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::warn!(partition_id = %partition_id, error = %err, "cache invalidation task failed");
            }
        }

        tracing::debug!(partition_id = %partition_id, users = user_ids.len(), "membership cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::models::{EntityNode, Role};
    use crate::retry::RetryPolicy;
    use crate::store::{GraphStore, InMemoryGraphStore};

    const P: &str = "p1";

    #[tokio::test]
    async fn entries_are_served_until_invalidated() {
        let store = Arc::new(InMemoryGraphStore::new());
        let group = EntityNode::group("g", "", P, "example.com");
        let alice = EntityNode::user("alice@example.com", P);
        store.create_node(&group).await.unwrap();
        store.create_node(&alice).await.unwrap();

        let traversal = TraversalService::new(store.clone(), RetryPolicy::immediate(1));
        let backend: Arc<InMemoryCache<EffectiveGroups>> = Arc::new(InMemoryCache::new());
        let cache = MembershipCache::new(backend.clone(), traversal, Duration::from_secs(60));

        assert!(cache.effective_groups(&alice.node_id, P).await.unwrap().is_empty());

        // Written behind the cache's back: the cached (empty) value is still served.
        store.add_edge(&group.node_id, &alice.node_id, Role::Member, P).await.unwrap();
        assert!(cache.effective_groups(&alice.node_id, P).await.unwrap().is_empty());

        cache.invalidate(&alice.node_id, P).await;
        let groups = cache.effective_groups(&alice.node_id, P).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, group.node_id);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_listed_user() {
        let store = Arc::new(InMemoryGraphStore::new());
        let traversal = TraversalService::new(store, RetryPolicy::immediate(1));
        let backend: Arc<InMemoryCache<EffectiveGroups>> = Arc::new(InMemoryCache::new());
        let cache = MembershipCache::new(backend.clone(), traversal, Duration::from_secs(60));

        for user in ["a@example.com", "b@example.com", "c@example.com"] {
            cache.effective_groups(user, P).await.unwrap();
        }
        assert_eq!(backend.len().await, 3);

        let users: BTreeSet<String> = ["a@example.com", "b@example.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cache.invalidate_all(&users, P).await;

        assert_eq!(backend.len().await, 1);
        assert!(backend.get(&MembershipCache::key("c@example.com", P)).await.is_some());
    }

    #[tokio::test]
    async fn load_bookkeeping_is_released() {
        let store = Arc::new(InMemoryGraphStore::new());
        let traversal = TraversalService::new(store, RetryPolicy::immediate(1));
        let backend: Arc<InMemoryCache<EffectiveGroups>> = Arc::new(InMemoryCache::new());
        let cache = MembershipCache::new(backend, traversal, Duration::from_secs(60));

        let users: BTreeSet<String> = (0..50).map(|i| format!("u{i}@example.com")).collect();
        for user in &users {
            cache.effective_groups(user, P).await.unwrap();
        }
        cache.invalidate_all(&users, P).await;
        cache.invalidate("never-loaded@example.com", P).await;

        assert_eq!(cache.tracked_keys(), 0);
    }
}
