//! Size-bounded TTL/LRU cache.
//!
//! [`TtlLruCache`] is a generic, thread-safe key/value store with a hard
//! capacity and optional per-entry expiry. It is the only structure shared
//! across stream sessions, so every operation is internally synchronized
//! and total: nothing but construction can fail.
//!
//! # Example
//!
//! ```ignore
//! let cache = TtlLruCache::new(2)?;
//! cache.put("k1", 1, Duration::ZERO);   // immortal until evicted by size
//! cache.put("k2", 2, Duration::from_secs(20));
//! assert_eq!(cache.get(&"k1"), Some(1)); // promotes k1
//! cache.put("k3", 3, Duration::ZERO);   // evicts k2, the least recently used
//! ```

pub mod config;
pub mod stats;
pub mod ttl_lru;

pub use config::CacheConfig;
pub use stats::CacheStats;
pub use ttl_lru::TtlLruCache;
