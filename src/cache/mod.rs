//! TTL file cache keyed by content hash.

pub mod clock;
pub mod memoize;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{hash_key, CacheConfig, CacheStats, CacheStore, CleanupReport};
