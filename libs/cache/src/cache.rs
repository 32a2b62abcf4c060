use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Configuration for an expiring cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of a record from its last `put` or `touch`.
    pub max_age: Duration,
    /// Interval between sweeps.
    pub sweep_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            sweep_period: Duration::from_secs(10),
        }
    }
}

/// Cache errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A record exists but holds no item. Indicates a bug in the owner.
    #[error("cache: record with empty item")]
    EmptyItem,
}

#[derive(Debug)]
struct Record<V> {
    item: Option<V>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Shared<K, V> {
    name: &'static str,
    max_age: Duration,
    records: RwLock<HashMap<K, Record<V>>>,
    stats: CacheStats,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash,
{
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at >= now);
        let evicted = before - records.len();

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(cache = self.name, evicted, remaining = records.len(), "Swept expired records");
        }
        evicted
    }
}

/// TTL map with a periodic sweeper.
pub struct ExpiringCache<K, V> {
    shared: Arc<Shared<K, V>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache and start its sweeper.
    ///
    /// Must be called from within a tokio runtime. The sweeper exits on
    /// `shutdown()` or when the cache is dropped.
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        let shared = Arc::new(Shared {
            name,
            max_age: config.max_age,
            records: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_sweeper(
            Arc::downgrade(&shared),
            config.sweep_period,
            shutdown_rx,
        ));

        Self {
            shared,
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Insert or replace the record for `key`.
    pub async fn put(&self, key: K, item: V) {
        let record = Record {
            item: Some(item),
            expires_at: Instant::now() + self.shared.max_age,
        };
        self.shared.records.write().await.insert(key, record);
    }

    /// Look up the item for `key`.
    ///
    /// Reads do not refresh the record's expiry.
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let records = self.shared.records.read().await;
        match records.get(key) {
            Some(Record { item: Some(item), .. }) => {
                self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item.clone()))
            }
            Some(Record { item: None, .. }) => Err(CacheError::EmptyItem),
            None => {
                self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// True if a record exists for `key`.
    pub async fn contains(&self, key: &K) -> bool {
        self.shared.records.read().await.contains_key(key)
    }

    /// Push the expiry of `key` to `now + max_age`. Returns false on a miss.
    pub async fn touch(&self, key: &K) -> bool {
        let mut records = self.shared.records.write().await;
        match records.get_mut(key) {
            Some(record) => {
                record.expires_at = Instant::now() + self.shared.max_age;
                true
            }
            None => false,
        }
    }

    /// Remove the record for `key`, returning its item.
    pub async fn remove(&self, key: &K) -> Option<V> {
        self.shared
            .records
            .write()
            .await
            .remove(key)
            .and_then(|record| record.item)
    }

    /// Number of records, expired-but-unswept ones included.
    pub async fn len(&self) -> usize {
        self.shared.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict expired records now. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        self.shared.sweep().await
    }

    /// Stop the sweeper. Idempotent.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.shutdown_tx.send_replace(true);
            info!(cache = self.shared.name, "Cache sweeper stopped");
        }
    }

    /// True once `shutdown()` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.shared.stats.hits.load(Ordering::Relaxed),
            misses: self.shared.stats.misses.load(Ordering::Relaxed),
            evictions: self.shared.stats.evictions.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    async fn put_empty(&self, key: K) {
        let record = Record {
            item: None,
            expires_at: Instant::now() + self.shared.max_age,
        };
        self.shared.records.write().await.insert(key, record);
    }
}

impl<K, V> Drop for ExpiringCache<K, V> {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn run_sweeper<K, V>(
    shared: Weak<Shared<K, V>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Eq + Hash,
{
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            _ = interval.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.sweep().await;
            }
        }
    }
}
