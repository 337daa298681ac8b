//! Access-policy cache with stale-while-revalidate
//!
//! Policies live in a remote [`PolicyStore`] that must not be read on every
//! request. Each cached entry goes through three ages, measured from its last
//! refresh:
//!
//! - younger than the soft TTL: served as is
//! - between soft and hard TTL: served, and a background refresh is scheduled
//! - older than the hard TTL (or absent): fetched synchronously
//!
//! A failed synchronous fetch falls back to the cached copy when one exists.
//! A `NotFound` answer is a revocation and evicts the entry instead.


use crate::ConcurrentMap;
use crate::error::StoreError;
use crate::policy::{AccessPolicy, unix_secs};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, watch};

// Configuration constants
const DEFAULT_SOFT_TTL_SECS: u64 = 5 * 60;
const DEFAULT_HARD_TTL_SECS: u64 = 15 * 60;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 2_000;

/// Authoritative source of access policies
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    async fn fetch_policy(&self, credential: &str) -> Result<AccessPolicy, StoreError>;
}

/// Cached policy snapshot with refresh bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPolicyEntry {
    pub policy: AccessPolicy,
    /// When the entry was first installed; kept across refreshes
    pub fetched_at: SystemTime,
    pub last_refreshed: SystemTime,
    pub refresh_count: u64,
}

impl CachedPolicyEntry {
    fn new(policy: AccessPolicy, now: SystemTime) -> Self {
        CachedPolicyEntry {
            policy,
            fetched_at: now,
            last_refreshed: now,
            refresh_count: 1,
        }
    }

    /// Time since the last refresh
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_refreshed)
            .unwrap_or(Duration::ZERO)
    }

    fn replace(&mut self, policy: AccessPolicy, now: SystemTime) {
        self.policy = policy;
        if now > self.last_refreshed {
            self.last_refreshed = now;
        }
        self.refresh_count += 1;
    }
}

/// Cache timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    /// Entries idle for twice this long are swept
    pub retention: Duration,
    pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            soft_ttl: Duration::from_secs(DEFAULT_SOFT_TTL_SECS),
            hard_ttl: Duration::from_secs(DEFAULT_HARD_TTL_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    stale_served: AtomicU64,
    evictions: AtomicU64,
    background_refreshes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    /// Cached copies served because a synchronous fetch failed
    pub stale_served: u64,
    pub evictions: u64,
    pub background_refreshes: u64,
    pub refreshes_in_flight: usize,
    pub entries: usize,
    pub hit_rate: f64,
}

struct CacheInner {
    entries: ConcurrentMap<String, CachedPolicyEntry>,
    /// Per-credential locks coalescing synchronous fetches
    fetch_locks: ConcurrentMap<String, Arc<Mutex<()>>>,
    /// Credentials with a background refresh in flight
    refreshing: ConcurrentMap<String, ()>,
    store: Arc<dyn PolicyStore>,
    config: CacheConfig,
    counters: CacheCounters,
    shutdown: watch::Sender<bool>,
}

/// Per-credential policy cache in front of a [`PolicyStore`]
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Clone)]
pub struct PolicyCache {
    inner: Arc<CacheInner>,
}

/// Builder for configuring a [`PolicyCache`]
pub struct PolicyCacheBuilder {
    store: Arc<dyn PolicyStore>,
    config: CacheConfig,
}

impl PolicyCache {
    /// Create a cache with the default TTLs
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<dyn PolicyStore>) -> PolicyCacheBuilder {
        PolicyCacheBuilder {
            store,
            config: CacheConfig::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up a policy using the system clock
    pub async fn get(&self, credential: &str) -> Result<CachedPolicyEntry, StoreError> {
        self.get_at(credential, SystemTime::now()).await
    }

    /// Look up a policy as of `now`
    pub async fn get_at(
        &self,
        credential: &str,
        now: SystemTime,
    ) -> Result<CachedPolicyEntry, StoreError> {
        let inner = &self.inner;

        let cached = inner
            .entries
            .get(credential)
            .map(|entry| entry.value().clone());

        if let Some(entry) = cached {
            let age = entry.age(now);
            if age < inner.config.soft_ttl {
                bump(&inner.counters.hits);
                return Ok(entry);
            }
            if age < inner.config.hard_ttl {
                bump(&inner.counters.stale_hits);
                self.schedule_refresh(credential, now);
                return Ok(entry);
            }
        }

        bump(&inner.counters.misses);
        inner.fetch_sync(credential, now).await
    }

    fn schedule_refresh(&self, credential: &str, now: SystemTime) {
        if *self.inner.shutdown.borrow() {
            return;
        }
        // At most one refresh in flight per credential
        if self
            .inner
            .refreshing
            .insert(credential.to_string(), ())
            .is_some()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let key = credential.to_string();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = inner.refresh(&key, now) => {}
                _ = shutdown.changed() => {
                    tracing::debug!(
                        credential = %crate::events::mask_credential(&key),
                        "Background refresh cancelled by shutdown"
                    );
                }
            }
            inner.refreshing.remove(&key);
        });
    }

    /// Drop a cached policy so the next lookup fetches it synchronously
    pub fn invalidate(&self, credential: &str) -> bool {
        let removed = self.inner.entries.remove(credential).is_some();
        if removed {
            bump(&self.inner.counters.evictions);
            tracing::debug!(
                credential = %crate::events::mask_credential(credential),
                "Policy cache entry invalidated"
            );
        }
        removed
    }

    /// Cached entry without touching the store or the statistics
    pub fn peek(&self, credential: &str) -> Option<CachedPolicyEntry> {
        self.inner
            .entries
            .get(credential)
            .map(|entry| entry.value().clone())
    }

    /// Evict entries not refreshed within twice the retention window
    pub fn sweep(&self, now: SystemTime) -> usize {
        let inner = &self.inner;
        let horizon = inner.config.retention * 2;

        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.age(now) <= horizon);
        let removed = before.saturating_sub(inner.entries.len());

        inner.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        inner
            .fetch_locks
            .retain(|key, lock| Arc::strong_count(lock) > 1 || inner.entries.contains_key(key));

        if removed > 0 {
            tracing::info!(
                removed,
                remaining = inner.entries.len(),
                cutoff = unix_secs(now).saturating_sub(horizon.as_secs()),
                "Swept idle policy cache entries"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let stale_hits = c.stale_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hits + stale_hits + misses;

        CacheStats {
            hits,
            stale_hits,
            misses,
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            background_refreshes: c.background_refreshes.load(Ordering::Relaxed),
            refreshes_in_flight: self.inner.refreshing.len(),
            entries: self.inner.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hits + stale_hits) as f64 / lookups as f64
            },
        }
    }

    /// Stop scheduling background refreshes and cancel those in flight
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Receiver that flips to `true` on [`PolicyCache::shutdown`]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}

impl CacheInner {
    async fn fetch_sync(
        &self,
        credential: &str,
        now: SystemTime,
    ) -> Result<CachedPolicyEntry, StoreError> {
        let lock = self
            .fetch_locks
            .entry(credential.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        // A concurrent miss may have fetched while we waited for the lock
        if let Some(entry) = self.entries.get(credential)
            && entry.age(now) < self.config.hard_ttl
        {
            return Ok(entry.value().clone());
        }

        match self.fetch(credential).await {
            Ok(policy) => Ok(self.install(credential, policy, now)),
            Err(StoreError::NotFound) => {
                if self.entries.remove(credential).is_some() {
                    bump(&self.counters.evictions);
                }
                tracing::warn!(
                    credential = %crate::events::mask_credential(credential),
                    "Policy no longer exists in store, cache entry evicted"
                );
                Err(StoreError::NotFound)
            }
            Err(StoreError::Unavailable(reason)) => {
                bump(&self.counters.fetch_failures);
                match self.entries.get(credential) {
                    Some(stale) => {
                        bump(&self.counters.stale_served);
                        tracing::warn!(
                            credential = %crate::events::mask_credential(credential),
                            age_secs = stale.age(now).as_secs(),
                            "Policy store unavailable, serving stale cache entry: {}",
                            reason
                        );
                        Ok(stale.value().clone())
                    }
                    None => {
                        tracing::error!(
                            credential = %crate::events::mask_credential(credential),
                            "Policy store unavailable and nothing cached: {}",
                            reason
                        );
                        Err(StoreError::Unavailable(reason))
                    }
                }
            }
        }
    }

    async fn fetch(&self, credential: &str) -> Result<AccessPolicy, StoreError> {
        bump(&self.counters.fetches);
        match tokio::time::timeout(self.config.fetch_timeout, self.store.fetch_policy(credential))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "fetch timed out after {}ms",
                self.config.fetch_timeout.as_millis()
            ))),
        }
    }

    fn install(
        &self,
        credential: &str,
        policy: AccessPolicy,
        now: SystemTime,
    ) -> CachedPolicyEntry {
        match self.entries.entry(credential.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.replace(policy, now);
                entry.clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(CachedPolicyEntry::new(policy, now))
                .value()
                .clone(),
        }
    }

    async fn refresh(&self, credential: &str, now: SystemTime) {
        bump(&self.counters.background_refreshes);

        match self.fetch(credential).await {
            Ok(policy) => match self.entries.get_mut(credential) {
                Some(mut entry) => entry.replace(policy, now),
                None => tracing::debug!(
                    credential = %crate::events::mask_credential(credential),
                    "Entry invalidated during background refresh, discarding result"
                ),
            },
            Err(StoreError::NotFound) => {
                if self.entries.remove(credential).is_some() {
                    bump(&self.counters.evictions);
                }
                tracing::warn!(
                    credential = %crate::events::mask_credential(credential),
                    "Policy disappeared during background refresh, cache entry evicted"
                );
            }
            Err(e) => {
                bump(&self.counters.fetch_failures);
                tracing::warn!(
                    credential = %crate::events::mask_credential(credential),
                    "Background policy refresh failed: {}",
                    e
                );
            }
        }
    }
}

impl PolicyCacheBuilder {
    /// Age after which an entry is refreshed in the background
    pub fn soft_ttl(mut self, ttl: Duration) -> Self {
        self.config.soft_ttl = ttl;
        self
    }

    /// Age after which an entry must be refetched before use
    pub fn hard_ttl(mut self, ttl: Duration) -> Self {
        self.config.hard_ttl = ttl;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    /// Upper bound on a single store fetch
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> PolicyCache {
        let mut config = self.config;
        if config.hard_ttl < config.soft_ttl {
            tracing::warn!(
                soft_ttl = ?config.soft_ttl,
                hard_ttl = ?config.hard_ttl,
                "Hard TTL shorter than soft TTL, raising it to match"
            );
            config.hard_ttl = config.soft_ttl;
        }

        let (shutdown, _) = watch::channel(false);
        PolicyCache {
            inner: Arc::new(CacheInner {
                entries: ConcurrentMap::default(),
                fetch_locks: ConcurrentMap::default(),
                refreshing: ConcurrentMap::default(),
                store: self.store,
                config,
                counters: CacheCounters::default(),
                shutdown,
            }),
        }
    }
}
