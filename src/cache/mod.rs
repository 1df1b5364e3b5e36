//! Cache contract and the per-user membership cache built on it.

mod membership;
mod memory;

pub use membership::{EffectiveGroups, MembershipCache};
pub use memory::InMemoryCache;

use std::time::Duration;

use async_trait::async_trait;

/// Key-value cache with per-entry expiry. Values are replaced whole.
///
/// Implementations swallow their own failures: a cache outage degrades to
/// misses, never to a failed mutation.
#[async_trait]
pub trait Cache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V>;

    async fn put(&self, key: &str, value: V, ttl: Duration);

    /// Delete if present.
    async fn delete(&self, key: &str);
}
