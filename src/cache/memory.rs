use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Cache;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Process-local cache; expired entries read as misses and are dropped lazily.
#[derive(Debug)]
pub struct InMemoryCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V> Default for InMemoryCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> InMemoryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<V> Cache<V> for InMemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).map(|entry| entry.expires_at <= now).unwrap_or(false) {
            entries.remove(key);
        }
        None
    }

    async fn put(&self, key: &str, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let cache: InMemoryCache<u32> = InMemoryCache::new();
        cache.put("k", 1, Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(1));

        cache.put("k", 2, Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(2));

        cache.delete("k").await;
        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache: InMemoryCache<u32> = InMemoryCache::new();
        cache.put("k", 1, Duration::ZERO).await;

        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }
}
