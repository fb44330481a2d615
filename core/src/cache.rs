use dashmap::DashMap;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::flow::ApiFlowGraph;

/// Bounded store of built flow graphs keyed by trace id.
///
/// Shared by every request task, so implementations handle their own locking.
pub trait FlowCache: Send + Sync {
    fn get(&self, trace_id: &str) -> Option<ApiFlowGraph>;

    fn insert(&self, graph: ApiFlowGraph);

    fn remove(&self, trace_id: &str) -> Option<ApiFlowGraph>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;
}

/// [`FlowCache`] evicting the least recently used graph once full.
pub struct LruFlowCache {
    inner: Mutex<LruCache<String, ApiFlowGraph>>,
    capacity: NonZeroUsize,
}

impl LruFlowCache {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, ApiFlowGraph>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FlowCache for LruFlowCache {
    fn get(&self, trace_id: &str) -> Option<ApiFlowGraph> {
        self.lock().get(trace_id).cloned()
    }

    fn insert(&self, graph: ApiFlowGraph) {
        let evicted = self.lock().push(graph.trace_id.clone(), graph);
        if let Some((trace_id, _)) = evicted {
            tracing::debug!(trace_id = %trace_id, "Evicted flow graph from cache");
        }
    }

    fn remove(&self, trace_id: &str) -> Option<ApiFlowGraph> {
        self.lock().pop(trace_id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

/// Keyed query cache with time-to-live expiry.
///
/// Intended for expensive backend queries that are called frequently but do
/// not need real-time data, such as the services list or a dependency graph
/// for a given lookback window. Failed fetches are never cached.
pub struct QueryCache<K, V> {
    entries: DashMap<K, CachedValue<V>>,
    ttl: Duration,
}

struct CachedValue<V> {
    data: V,
    expires_at: Instant,
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return the cached value for `key`, or run `fetch_fn` and cache its result.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch_fn: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(cached) = self.entries.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.data.clone());
            }
        }

        let data = fetch_fn().await?;

        // callers pick the keys, so expired ones are dropped here
        let now = Instant::now();
        self.entries.retain(|_, cached| cached.expires_at > now);
        self.entries.insert(
            key,
            CachedValue {
                data: data.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(data)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_valid(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|cached| cached.expires_at > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowStatus;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn graph(trace_id: &str) -> ApiFlowGraph {
        ApiFlowGraph {
            trace_id: trace_id.to_string(),
            root_service: "svc".into(),
            root_endpoint: "/".into(),
            start_time: Utc::now(),
            total_duration_us: 0,
            nodes: Vec::new(),
            edges: Vec::new(),
            status: FlowStatus::Success,
            span_count: 1,
            correlated_incident_ids: Vec::new(),
        }
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = LruFlowCache::new(2);
        cache.insert(graph("a"));
        cache.insert(graph("b"));

        // touch "a" so "b" becomes the eviction candidate
        assert!(cache.get("a").is_some());
        cache.insert(graph("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_lru_zero_capacity_holds_one() {
        let cache = LruFlowCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(graph("a"));
        cache.insert(graph("b"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove("b").map(|g| g.trace_id), Some("b".to_string()));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_returns_cached_value() {
        let cache = QueryCache::new(Duration::from_secs(10));
        let call_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count_clone = call_count.clone();
            let result = cache
                .get_or_fetch(3600u64, || async move {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec!["orders".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(result, vec!["orders".to_string()]);
        }
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_keys_are_independent() {
        let cache = QueryCache::new(Duration::from_secs(10));
        let a = cache
            .get_or_fetch("1h", || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        let b = cache
            .get_or_fetch("24h", || async { Ok::<_, String>(24) })
            .await
            .unwrap();
        assert_eq!((a, b), (1, 24));

        cache.invalidate(&"1h");
        assert!(!cache.is_valid(&"1h"));
        assert!(cache.is_valid(&"24h"));
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cache = QueryCache::new(Duration::from_millis(100));
        let call_count = Arc::new(AtomicUsize::new(0));

        let fetch = |count: Arc<AtomicUsize>| async move {
            Ok::<_, String>(count.fetch_add(1, Ordering::SeqCst) + 1)
        };

        assert_eq!(cache.get_or_fetch((), || fetch(call_count.clone())).await, Ok(1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get_or_fetch((), || fetch(call_count.clone())).await, Ok(2));
    }

    #[tokio::test]
    async fn test_expired_keys_are_dropped_on_insert() {
        let cache = QueryCache::new(Duration::from_millis(50));
        for window in [60_000u128, 120_000, 3_600_000] {
            cache
                .get_or_fetch(window, || async { Ok::<_, String>(window) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 3);

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache
            .get_or_fetch(90_000u128, || async { Ok::<_, String>(0) })
            .await
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.is_valid(&90_000));
        assert!(!cache.is_valid(&60_000));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = QueryCache::new(Duration::from_secs(10));
        let call_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count_clone = call_count.clone();
            let result = cache
                .get_or_fetch("services", || async move {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                    Err::<Vec<String>, _>("backend down")
                })
                .await;
            assert_eq!(result.unwrap_err(), "backend down");
        }
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        cache.invalidate_all();
    }
}
