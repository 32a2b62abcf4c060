//! Expiring-record cache.
//!
//! A keyed map whose records carry an expiry instant. Records are refreshed
//! only by explicit activity (`put`, `touch`), never by reads. A background
//! sweeper runs on a fixed period and evicts records whose expiry has
//! passed; `shutdown()` stops it, after which records are kept until they
//! are removed explicitly.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ubot_cache::CacheError> {
//! use std::time::Duration;
//! use ubot_cache::{CacheConfig, ExpiringCache};
//!
//! let cache = ExpiringCache::new("results", CacheConfig {
//!     max_age: Duration::from_secs(60),
//!     sweep_period: Duration::from_secs(5),
//! });
//! cache.put("k".to_string(), 7u32).await;
//! assert_eq!(cache.get(&"k".to_string()).await?, Some(7));
//! cache.shutdown();
//! # Ok(())
//! # }
//! ```

mod cache;

pub use cache::{CacheConfig, CacheCounters, CacheError, ExpiringCache};
