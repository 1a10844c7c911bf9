//! Single-flight TTL response cache.
//!
//! One structure covers both halves of redundant-call avoidance: a TTL-keyed
//! cache of completed results, and a registry of in-flight fetches that
//! concurrent callers for the same key join instead of issuing duplicate
//! upstream calls. Both maps live under one mutex so the check-then-register
//! step is atomic.
//!
//! The cache write happens inside the queued job itself, not on the waiting
//! side: a caller that gives up at its timeout still pays for a result that
//! later callers get for free.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::LinkError;
use crate::queue::RequestQueue;

type SharedFetch<T> = Shared<Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send>>>;

struct CacheEntry<T> {
    value: T,
    cached_at: Instant,
}

struct Inner<T> {
    cache: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, SharedFetch<T>>,
}

/// TTL cache plus in-flight deduplication for one resource class.
///
/// Clones share the same cache and pending registry.
pub struct SingleFlight<T: Clone> {
    inner: Arc<Mutex<Inner<T>>>,
    ttl: Duration,
    queue: RequestQueue,
    timeout: Duration,
}

impl<T: Clone> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
            queue: self.queue.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new(ttl: Duration, queue: RequestQueue, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache: HashMap::new(),
                pending: HashMap::new(),
            })),
            ttl,
            queue,
            timeout,
        }
    }

    /// Return a fresh cached value, or join the pending fetch for `key`, or
    /// enqueue `compute` on the request queue and register it as pending.
    ///
    /// Only successful results are cached. The pending marker is cleared when
    /// the fetch settles, success or failure.
    pub async fn get<F>(&self, key: &str, compute: F) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let fetch = {
            let mut inner = self.inner.lock();

            if let Some(entry) = inner.cache.get(key) {
                if entry.cached_at.elapsed() < self.ttl {
                    tracing::debug!(key, "cache hit");
                    return Ok(entry.value.clone());
                }
                // Stale entry; it gets overwritten by the next success.
            }

            if let Some(pending) = inner.pending.get(key) {
                tracing::debug!(key, "joining in-flight fetch");
                pending.clone()
            } else {
                let shared = self.start_fetch(key.to_string(), compute);
                inner.pending.insert(key.to_string(), shared.clone());
                shared
            }
        };

        fetch.await
    }

    fn start_fetch<F>(&self, key: String, compute: F) -> SharedFetch<T>
    where
        F: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let queue = self.queue.clone();
        let timeout = self.timeout;

        let fut = async move {
            let worker_inner = Arc::clone(&inner);
            let worker_key = key.clone();
            let task = async move {
                let out = compute.await;
                if let Ok(value) = &out {
                    worker_inner.lock().cache.insert(
                        worker_key,
                        CacheEntry {
                            value: value.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                }
                out
            };

            let out = queue.run(timeout, task).await;
            inner.lock().pending.remove(&key);
            out
        };

        (Box::pin(fut) as Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send>>).shared()
    }

    /// Fresh cached value for `key`, if any. Never triggers or joins a fetch.
    pub fn peek(&self, key: &str) -> Option<T> {
        let inner = self.inner.lock();
        let entry = inner.cache.get(key)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.value.clone())
    }

    /// Drop every cached entry and pending marker whose key starts with
    /// `prefix`. Used around connect and disconnect.
    pub fn invalidate(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        inner.cache.retain(|k, _| !k.starts_with(prefix));
        inner.pending.retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.invalidate("");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> RequestQueue {
        RequestQueue::new(Duration::from_millis(10))
    }

    fn counting_compute(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl Future<Output = Result<u32, LinkError>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_upstream_call() {
        let flight = SingleFlight::new(Duration::from_secs(600), queue(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let flight = flight.clone();
            let compute = counting_compute(&calls, 42);
            tokio::spawn(async move { flight.get("accounts/item-1", compute).await })
        };
        let b = {
            let flight = flight.clone();
            let compute = counting_compute(&calls, 42);
            tokio::spawn(async move { flight.get("accounts/item-1", compute).await })
        };

        assert_eq!(a.await.unwrap().unwrap(), 42);
        assert_eq!(b.await.unwrap().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_within_ttl_skips_upstream() {
        let ttl = Duration::from_secs(600);
        let flight = SingleFlight::new(ttl, queue(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        flight
            .get("accounts/item-1", counting_compute(&calls, 1))
            .await
            .unwrap();
        flight
            .get("accounts/item-1", counting_compute(&calls, 2))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(ttl + Duration::from_secs(1)).await;
        let refreshed = flight
            .get("accounts/item-1", counting_compute(&calls, 3))
            .await
            .unwrap();
        assert_eq!(refreshed, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let flight = SingleFlight::new(Duration::from_secs(600), queue(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        let fail_calls = Arc::clone(&calls);
        let failed = flight
            .get("transactions/item-1", async move {
                fail_calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(LinkError::fatal("down"))
            })
            .await;
        assert!(failed.is_err());

        let ok = flight
            .get("transactions/item-1", counting_compute(&calls, 5))
            .await
            .unwrap();
        assert_eq!(ok, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_caller_still_populates_cache() {
        let flight = SingleFlight::new(Duration::from_secs(600), queue(), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_calls = Arc::clone(&calls);
        let timed_out = flight
            .get("accounts/item-1", async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                slow_calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await;
        assert_eq!(timed_out, Err(LinkError::Timeout));

        // Let the worker finish the abandoned job.
        tokio::time::sleep(Duration::from_secs(30)).await;

        let cached = flight
            .get("accounts/item-1", counting_compute(&calls, 1))
            .await
            .unwrap();
        assert_eq!(cached, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handles_are_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SingleFlight<Vec<u32>>>();
    }

    #[tokio::test(start_paused = true)]
    async fn peek_serves_fresh_entries_without_fetching() {
        let ttl = Duration::from_secs(600);
        let flight = SingleFlight::new(ttl, queue(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(flight.peek("accounts/item-1"), None);
        flight
            .get("accounts/item-1", counting_compute(&calls, 7))
            .await
            .unwrap();
        assert_eq!(flight.peek("accounts/item-1"), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(ttl + Duration::from_secs(1)).await;
        assert_eq!(flight.peek("accounts/item-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_clears_matching_prefix_only() {
        let flight = SingleFlight::new(Duration::from_secs(600), queue(), Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));

        flight
            .get("accounts/item-1", counting_compute(&calls, 1))
            .await
            .unwrap();
        flight
            .get("transactions/item-1", counting_compute(&calls, 2))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        flight.invalidate("accounts/");

        flight
            .get("accounts/item-1", counting_compute(&calls, 3))
            .await
            .unwrap();
        flight
            .get("transactions/item-1", counting_compute(&calls, 4))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
