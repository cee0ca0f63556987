//! Keyed query cache with stale-while-revalidate and request coalescing.
//!
//! Each entry carries its own [`CachePolicy`]:
//!
//! - younger than `stale_after`: served as-is
//! - between `stale_after` and `evict_after`: served, and a background
//!   refresh is started
//! - older than `evict_after`: never served; the caller waits for a fetch
//!
//! Storage is a `moka` cache whose per-entry expiry is `evict_after`, so
//! expired entries are reclaimed. Freshness is judged on read against
//! [`tokio::time::Instant`], which keeps it exact (and controllable in
//! tests) regardless of when `moka` gets round to reclaiming.
//!
//! Concurrent requests for a key share one in-flight fetch. Invalidating a
//! prefix drops matching entries and marks matching in-flight fetches as
//! superseded, so a fetch started before a mutation can never write its
//! older result back into the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use moka::Expiry;
use moka::future::Cache;
use tokio::time::Instant;
use tracing::debug;

use crate::gateway::GatewayError;

const MAX_ENTRIES: u64 = 1000;

/// How long a cached value stays fresh, and how long it may be served at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub stale_after: Duration,
    pub evict_after: Duration,
}

impl CachePolicy {
    #[must_use]
    pub const fn new(stale_after: Duration, evict_after: Duration) -> Self {
        Self {
            stale_after,
            evict_after,
        }
    }

    /// Cart data: 30 seconds fresh, gone after 5 minutes.
    #[must_use]
    pub const fn cart() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(300))
    }

    /// Catalog data: 5 minutes fresh, gone after 30 minutes.
    #[must_use]
    pub const fn catalog() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(1800))
    }
}

/// Cache keys. Prefix invalidation relies on their shape.
pub mod keys {
    use urban_threads_core::{ProductId, UserId};

    #[must_use]
    pub fn cart(user: &UserId) -> String {
        format!("cart:{user}:")
    }

    #[must_use]
    pub fn product(id: &ProductId) -> String {
        format!("product:{id}")
    }

    #[must_use]
    pub fn listing(category: &str, sort: &str, name_filter: &str) -> String {
        format!("products:{category}:{sort}:{name_filter}")
    }

    #[must_use]
    pub fn related(category: &str, id: &ProductId) -> String {
        format!("related:{category}:{id}")
    }

    #[must_use]
    pub fn featured() -> String {
        "featured".to_owned()
    }

    #[must_use]
    pub fn new_arrivals() -> String {
        "new-arrivals".to_owned()
    }

    #[must_use]
    pub fn search(term: &str) -> String {
        format!("search:{term}")
    }

    #[must_use]
    pub fn category_counts() -> String {
        "categories".to_owned()
    }
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    fetched_at: Instant,
    policy: CachePolicy,
}

struct EntryExpiry;

impl<V> Expiry<String, Entry<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.policy.evict_after)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry<V>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.policy.evict_after)
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, GatewayError>>>;

struct InFlight<V> {
    id: u64,
    fetch: SharedFetch<V>,
    superseded: Arc<AtomicBool>,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    /// Past its staleness threshold; a refresh is due.
    pub stale: bool,
}

/// Query cache for values of type `V`. Cheaply cloneable.
pub struct QueryCache<V> {
    inner: Arc<QueryCacheInner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueryCacheInner<V> {
    store: Cache<String, Entry<V>>,
    in_flight: Mutex<HashMap<String, InFlight<V>>>,
    next_fetch_id: AtomicU64,
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        let store = Cache::builder()
            .max_capacity(MAX_ENTRIES)
            .expire_after(EntryExpiry)
            .build();

        Self {
            inner: Arc::new(QueryCacheInner {
                store,
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
            }),
        }
    }

    /// Look up `key`. Evicted entries are a miss.
    pub async fn get(&self, key: &str) -> Option<Cached<V>> {
        let entry = self.inner.store.get(key).await?;
        let age = entry.fetched_at.elapsed();
        if age >= entry.policy.evict_after {
            self.inner.store.invalidate(key).await;
            return None;
        }
        Some(Cached {
            value: entry.value,
            stale: age >= entry.policy.stale_after,
        })
    }

    /// Store `value` under `key` as freshly fetched.
    pub async fn set(&self, key: &str, value: V, policy: CachePolicy) {
        self.inner
            .store
            .insert(
                key.to_owned(),
                Entry {
                    value,
                    fetched_at: Instant::now(),
                    policy,
                },
            )
            .await;
    }

    /// Serve `key` from the cache, fetching on a miss.
    ///
    /// A stale hit is returned immediately and refreshed in the background.
    /// A miss joins the key's in-flight fetch if there is one.
    ///
    /// # Errors
    ///
    /// Returns the fetch's error on a miss. Failed fetches are not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        policy: CachePolicy,
        fetch: F,
    ) -> Result<V, GatewayError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        if let Some(hit) = self.get(key).await {
            if hit.stale {
                debug!(key, "Serving stale entry, refreshing in background");
                drop(self.join_or_start(key, policy, fetch));
            }
            return Ok(hit.value);
        }
        self.join_or_start(key, policy, fetch).await
    }

    /// Fetch `key` regardless of what is cached, joining an in-flight fetch
    /// if there is one.
    ///
    /// # Errors
    ///
    /// Returns the fetch's error. Failed fetches are not cached.
    pub async fn fetch<F, Fut>(&self, key: &str, policy: CachePolicy, fetch: F) -> Result<V, GatewayError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        self.join_or_start(key, policy, fetch).await
    }

    /// Drop every entry whose key starts with `prefix` and supersede
    /// matching in-flight fetches.
    pub async fn invalidate(&self, prefix: &str) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.retain(|key, fetch| {
                let matched = key.starts_with(prefix);
                if matched {
                    fetch.superseded.store(true, Ordering::SeqCst);
                }
                !matched
            });
        }

        let doomed: Vec<Arc<String>> = self
            .inner
            .store
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            self.inner.store.invalidate(key.as_str()).await;
        }
        debug!(prefix, "Cache invalidated");
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.invalidate("").await;
    }

    /// Whether a fetch for `key` is currently outstanding.
    #[must_use]
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .is_ok_and(|in_flight| in_flight.contains_key(key))
    }

    fn join_or_start<F, Fut>(&self, key: &str, policy: CachePolicy, fetch: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        let mut in_flight = match self.inner.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = in_flight.get(key) {
            debug!(key, "Joining in-flight fetch");
            return existing.fetch.clone();
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::SeqCst);
        let superseded = Arc::new(AtomicBool::new(false));
        let cache = self.clone();
        let owned_key = key.to_owned();
        let flag = Arc::clone(&superseded);
        let request = fetch();

        // Spawned so the fetch completes (and fills the cache) even if every
        // caller stops waiting.
        let task = tokio::spawn(async move {
            let result = request.await;
            if let Ok(value) = &result {
                cache.store_unless_superseded(&owned_key, value, policy, &flag).await;
            }
            cache.finish(&owned_key, id);
            result
        });

        let shared = async move {
            task.await
                .unwrap_or_else(|e| Err(GatewayError::Transport(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.to_owned(),
            InFlight {
                id,
                fetch: shared.clone(),
                superseded,
            },
        );
        shared
    }

    async fn store_unless_superseded(
        &self,
        key: &str,
        value: &V,
        policy: CachePolicy,
        superseded: &AtomicBool,
    ) {
        if superseded.load(Ordering::SeqCst) {
            debug!(key, "Discarding superseded fetch");
            return;
        }
        self.set(key, value.clone(), policy).await;
        // Invalidated while the insert was pending.
        if superseded.load(Ordering::SeqCst) {
            self.inner.store.invalidate(key).await;
        }
    }

    fn finish(&self, key: &str, id: u64) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock()
            && in_flight.get(key).is_some_and(|f| f.id == id)
        {
            in_flight.remove(key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use urban_threads_core::UserId;

    use super::*;

    const POLICY: CachePolicy = CachePolicy::new(Duration::from_secs(30), Duration::from_secs(300));

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, GatewayError>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value.to_owned())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = QueryCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_fetch("cart:u-1", POLICY, counting_fetch(Arc::clone(&calls), "lines")),
            cache.get_or_fetch("cart:u-1", POLICY, counting_fetch(Arc::clone(&calls), "other")),
        );

        assert_eq!(a.unwrap(), "lines");
        assert_eq!(b.unwrap(), "lines");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_fetch() {
        let cache = QueryCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set("product:p-1", "cached".to_owned(), POLICY).await;

        let value = cache
            .get_or_fetch("product:p-1", POLICY, counting_fetch(Arc::clone(&calls), "fetched"))
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_hit_served_then_refreshed() {
        let cache = QueryCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.set("cart:u-1", "old".to_owned(), POLICY).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let value = cache
            .get_or_fetch("cart:u-1", POLICY, counting_fetch(Arc::clone(&calls), "new"))
            .await
            .unwrap();
        assert_eq!(value, "old");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let hit = cache.get("cart:u-1").await.unwrap();
        assert_eq!(hit.value, "new");
        assert!(!hit.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_entry_is_never_served() {
        let cache = QueryCache::<String>::new();
        cache.set("cart:u-1", "old".to_owned(), POLICY).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get("cart:u-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_by_prefix() {
        let cache = QueryCache::<String>::new();
        cache.set("cart:u-1", "a".to_owned(), POLICY).await;
        cache.set("cart:u-12", "b".to_owned(), POLICY).await;
        cache.set("cart:u-2", "c".to_owned(), POLICY).await;

        cache.invalidate("cart:u-1").await;
        assert!(cache.get("cart:u-1").await.is_none());
        assert!(cache.get("cart:u-12").await.is_none());
        assert!(cache.get("cart:u-2").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cart_key_invalidates_only_its_user() {
        let cache = QueryCache::<String>::new();
        let first = keys::cart(&UserId::new("u-1"));
        let other = keys::cart(&UserId::new("u-12"));
        cache.set(&first, "a".to_owned(), POLICY).await;
        cache.set(&other, "b".to_owned(), POLICY).await;

        cache.invalidate(&first).await;
        assert!(cache.get(&first).await.is_none());
        assert!(cache.get(&other).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fetch_does_not_fill_cache() {
        let cache = QueryCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = tokio::spawn({
            let cache = cache.clone();
            let fetch = counting_fetch(Arc::clone(&calls), "before-mutation");
            async move { cache.get_or_fetch("cart:u-1", POLICY, fetch).await }
        });
        while !cache.is_fetching("cart:u-1") {
            tokio::task::yield_now().await;
        }

        cache.invalidate("cart:u-1").await;
        assert!(!cache.is_fetching("cart:u-1"));

        assert_eq!(pending.await.unwrap().unwrap(), "before-mutation");
        assert!(cache.get("cart:u-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_is_not_cached() {
        let cache = QueryCache::<String>::new();
        let result = cache
            .get_or_fetch("cart:u-1", POLICY, || async {
                Err(GatewayError::Transport("reset".to_owned()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get("cart:u-1").await.is_none());
        assert!(!cache.is_fetching("cart:u-1"));
    }
}
