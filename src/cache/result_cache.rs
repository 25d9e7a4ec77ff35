use crate::config::CacheConfig;
use crate::utils::SharedClock;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Payloads stored in the cache. `is_well_formed` is checked on every read; an
/// entry that fails it is evicted and reported as a miss.
pub trait CachePayload: Send + Sync + 'static {
    fn is_well_formed(&self) -> bool;
}

/// Which TTL an entry gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlClass {
    #[default]
    Default,
    /// Slow-changing data kept for the longer reference TTL.
    Reference,
}

struct CacheEntry<V> {
    payload: Arc<V>,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// TTL cache of computed results keyed by query shape.
///
/// Entries are immutable and shared as `Arc<V>`; an insert replaces the whole
/// entry. Reads never return an entry at or past its TTL. When `max_entries` is
/// reached, expired entries are purged first and then the oldest entry goes.
pub struct ResultCache<V: CachePayload> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    config: CacheConfig,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: CachePayload> ResultCache<V> {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if entry.is_valid(now) && entry.payload.is_well_formed() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {}
            }
        }

        // Expired or corrupt: drop it under the write lock, unless it was replaced meanwhile.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if !entry.is_valid(now) {
                debug!(key, "Cache entry expired");
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            } else if !entry.payload.is_well_formed() {
                warn!(key, "Evicting malformed cache entry");
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: impl Into<String>, payload: Arc<V>) {
        self.insert_with(key, payload, TtlClass::Default)
    }

    pub fn insert_with(&self, key: impl Into<String>, payload: Arc<V>, class: TtlClass) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        self.store(&mut entries, key.into(), payload, self.ttl_for(class), now);
    }

    /// Insert `payload` unless the key already holds a live entry created at or
    /// after `since`. Returns whichever payload the cache holds afterwards.
    pub fn insert_unless_newer(&self, key: impl Into<String>, payload: Arc<V>, since: Instant) -> Arc<V> {
        let key = key.into();
        let now = self.clock.now();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.created_at >= since && existing.is_valid(now) && existing.payload.is_well_formed() {
                debug!(key = %key, "Keeping newer cache entry over a late result");
                return existing.payload.clone();
            }
        }
        self.store(&mut entries, key, payload.clone(), self.config.default_ttl(), now);
        payload
    }

    /// Current time on the cache's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Default => self.config.default_ttl(),
            TtlClass::Reference => self.config.reference_ttl(),
        }
    }

    fn store(&self, entries: &mut HashMap<String, CacheEntry<V>>, key: String, payload: Arc<V>, ttl: Duration, now: Instant) {
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let before = entries.len();
            entries.retain(|_, e| e.is_valid(now));
            let mut evicted = before - entries.len();

            if entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    evicted += 1;
                }
            }
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Cache full, made room");
        }

        entries.insert(
            key,
            CacheEntry {
                payload,
                created_at: now,
                ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_valid(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = entries.len(), "Swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "Result cache stats: entries={}, hits={}, misses={}, evictions={}",
            stats.entries, stats.hits, stats.misses, stats.evictions
        );
    }

    /// Start the periodic sweep. Must be called inside a tokio runtime; a second
    /// call replaces the running sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let interval = self.config.sweep_interval();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweeper and drop every entry.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.clear();
        self.log_stats();
    }
}

impl<V: CachePayload> Drop for ResultCache<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
