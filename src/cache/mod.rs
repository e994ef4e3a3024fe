//! Capacity-bounded caches with pin-counted eviction
//!
//! All dump access funnels through three caches: opened dump stores keyed
//! by file path, decoded documents keyed by `(dump id, path)`, and decoded
//! result chunks keyed by `(dump id, chunk id)`. They share one generic
//! implementation with a single contract:
//!
//! - `with_entry` acquires (running the factory on a miss), pins the entry
//!   for the duration of the user closure, then releases;
//! - concurrent misses on the same key coalesce onto one factory call;
//! - eviction is strict LRU over unpinned entries, and a pinned entry is
//!   never evicted, so capacity may be exceeded transiently while every
//!   resident entry is pinned.
//!
//! Pins are released by a drop guard, so a request cancelled mid-flight
//! still unpins on unwind. The interior lock is a plain mutex: every
//! critical section is short and never awaits.
//!
//! Capacity is measured in entries, uniformly across the three caches.

use crate::config::Config;
use crate::dump::DumpStore;
use crate::error::Result;
use crate::models::{DocumentData, ResultChunkData};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Key of the decoded-document cache.
pub type DocumentKey = (i64, String);
/// Key of the decoded result-chunk cache.
pub type ChunkKey = (i64, i64);

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Entry<V> {
    value: Arc<V>,
    pins: usize,
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency index: tick -> key. Ticks are unique, so iteration order is
    /// least-recently-used first.
    recency: BTreeMap<u64, K>,
    clock: u64,
}

pub struct BoundedCache<K, V> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
    /// Per-key gates serializing concurrent misses (the factory runs once;
    /// waiters re-check the cache after the leader finishes).
    inflight: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
    stats: CacheStats,
}

/// Releases a pin when dropped, including on cancellation unwind.
struct PinGuard<'a, K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    cache: &'a BoundedCache<K, V>,
    key: &'a K,
}

impl<K, V> Drop for PinGuard<'_, K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cache.release(self.key);
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                clock: 0,
            }),
            inflight: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Acquire the entry for `key` (creating it via `factory` on a miss),
    /// pin it for the duration of `user`, then release it. The pin protects
    /// the entry from eviction; releasing marks it most recently used.
    pub async fn with_entry<F, Fut, U, FutU, R>(&self, key: K, factory: F, user: U) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
        U: FnOnce(Arc<V>) -> FutU,
        FutU: Future<Output = Result<R>>,
    {
        let value = self.acquire(key.clone(), factory).await?;
        let _pin = PinGuard {
            cache: self,
            key: &key,
        };
        user(value).await
    }

    async fn acquire<F, Fut>(&self, key: K, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.pin_existing(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Someone else may have populated the entry while we waited.
        if let Some(value) = self.pin_existing(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.inflight.remove(&key);
            return Ok(value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let value = match factory().await {
            Ok(value) => Arc::new(value),
            Err(err) => {
                self.inflight.remove(&key);
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            inner.clock += 1;
            let tick = inner.clock;
            inner.recency.insert(tick, key.clone());
            inner.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    pins: 1,
                    tick,
                },
            );
            self.evict_excess(&mut inner);
        }
        self.inflight.remove(&key);
        Ok(value)
    }

    fn pin_existing(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let entry = inner.entries.get(key)?;
        let old_tick = entry.tick;
        let value = entry.value.clone();

        inner.clock += 1;
        let tick = inner.clock;
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key.clone());
        let entry = inner.entries.get_mut(key).expect("entry disappeared");
        entry.pins += 1;
        entry.tick = tick;
        Some(value)
    }

    fn release(&self, key: &K) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.pins = entry.pins.saturating_sub(1);
            self.evict_excess(&mut inner);
        }
    }

    /// Drop the entry for `key` if present, regardless of recency. Pinned
    /// holders keep their `Arc` alive; the next acquire re-creates the
    /// entry. Used when a dump file is replaced underneath its cache key.
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.remove(key) {
            inner.recency.remove(&entry.tick);
            debug!(cache = self.name, "invalidated cache entry");
        }
    }

    fn evict_excess(&self, inner: &mut Inner<K, V>) {
        while inner.entries.len() > self.capacity {
            let victim = inner
                .recency
                .iter()
                .find(|(_, key)| inner.entries.get(key).is_some_and(|e| e.pins == 0))
                .map(|(tick, key)| (*tick, key.clone()));
            let Some((tick, key)) = victim else {
                // Everything resident is pinned; allow the overflow until a
                // pin drops.
                break;
            };
            inner.recency.remove(&tick);
            inner.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The three caches every query path shares.
pub struct CacheTier {
    pub connections: BoundedCache<PathBuf, DumpStore>,
    pub documents: BoundedCache<DocumentKey, DocumentData>,
    pub chunks: BoundedCache<ChunkKey, ResultChunkData>,
}

impl CacheTier {
    pub fn new(config: &Config) -> Self {
        Self {
            connections: BoundedCache::new("connections", config.connection_cache_capacity),
            documents: BoundedCache::new("documents", config.document_cache_capacity),
            chunks: BoundedCache::new("result_chunks", config.result_chunk_cache_capacity),
        }
    }

    /// Forget any open handle for a dump file; called after a conversion
    /// replaces the file so readers pick up the new contents.
    pub async fn invalidate_dump(&self, path: &PathBuf) {
        self.connections.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio::time::{sleep, Duration};

    fn cache(capacity: usize) -> Arc<BoundedCache<String, u64>> {
        Arc::new(BoundedCache::new("test", capacity))
    }

    async fn get(cache: &BoundedCache<String, u64>, key: &str, builds: &Arc<AtomicUsize>) -> u64 {
        let builds = builds.clone();
        cache
            .with_entry(
                key.to_string(),
                move || async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                },
                |value| async move { Ok(*value) },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache = cache(4);
        let builds = Arc::new(AtomicUsize::new(0));

        assert_eq!(get(&cache, "a", &builds).await, 7);
        assert_eq!(get(&cache, "a", &builds).await, 7);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let cache = cache(4);
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .with_entry(
                        "shared".to_string(),
                        move || async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(20)).await;
                            Ok(42)
                        },
                        |value| async move { Ok(*value) },
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let cache = cache(2);
        let builds = Arc::new(AtomicUsize::new(0));

        get(&cache, "a", &builds).await;
        get(&cache, "b", &builds).await;
        // Touch "a" so "b" is now least recently used.
        get(&cache, "a", &builds).await;
        get(&cache, "c", &builds).await;
        assert_eq!(builds.load(Ordering::SeqCst), 3);

        // "a" survived, "b" was evicted.
        get(&cache, "a", &builds).await;
        assert_eq!(builds.load(Ordering::SeqCst), 3);
        get(&cache, "b", &builds).await;
        assert_eq!(builds.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_eviction() {
        let cache = cache(1);
        let builds = Arc::new(AtomicUsize::new(0));
        let pinned = Notify::new();
        let release = Arc::new(Notify::new());

        let cache2 = cache.clone();
        let builds2 = builds.clone();
        let release2 = release.clone();
        let holder = {
            let pinned = &pinned;
            async move {
                let builds = builds2.clone();
                cache2
                    .with_entry(
                        "a".to_string(),
                        move || async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            Ok(1)
                        },
                        |_| async move {
                            pinned.notify_one();
                            release2.notified().await;
                            Ok(())
                        },
                    )
                    .await
                    .unwrap();
            }
        };

        let driver = async {
            pinned.notified().await;
            // Over capacity while "a" is pinned: "a" must stay resident.
            get(&cache, "b", &builds).await;
            get(&cache, "a", &builds).await;
            assert_eq!(builds.load(Ordering::SeqCst), 2);
            release.notify_one();
        };

        tokio::join!(holder, driver);

        // With all pins dropped the cache shrinks back under capacity and
        // honors LRU for the next insert.
        get(&cache, "c", &builds).await;
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_cancelled_user_releases_pin() {
        let cache = cache(1);
        let builds = Arc::new(AtomicUsize::new(0));

        // A user future that would block forever, dropped via timeout: the
        // pin must be released on unwind so the entry stays evictable.
        let blocked = cache.with_entry(
            "a".to_string(),
            || async { Ok(1u64) },
            |_| async {
                std::future::pending::<()>().await;
                Ok(())
            },
        );
        let _ = tokio::time::timeout(Duration::from_millis(20), blocked).await;

        // The entry is unpinned: inserting another key evicts it.
        get(&cache, "b", &builds).await;
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_factory_error_does_not_poison() {
        let cache = cache(4);
        let result: Result<u64> = cache
            .with_entry(
                "a".to_string(),
                || async { Err(Error::Fatal("boom".to_string())) },
                |value| async move { Ok(*value) },
            )
            .await;
        assert!(result.is_err());

        // A later acquire retries the factory.
        let builds = Arc::new(AtomicUsize::new(0));
        assert_eq!(get(&cache, "a", &builds).await, 7);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_forces_rebuild() {
        let cache = cache(4);
        let builds = Arc::new(AtomicUsize::new(0));
        get(&cache, "a", &builds).await;
        cache.remove(&"a".to_string());
        get(&cache, "a", &builds).await;
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
