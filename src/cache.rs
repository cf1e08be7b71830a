//! Two-tier memoization of query responses.
//!
//! ## Architecture
//!
//! ```text
//! +------------+     +-----------------+
//! | QueryCache | --> |  SingleFlight   |  <- one leader per digest
//! +------------+     +-----------------+
//!    |      |
//!    v      v
//! +-----+ +-----------+
//! | LRU | | RedisTier |  <- Tier-1 in-process / Tier-2 remote (optional)
//! +-----+ +-----------+
//! ```
//!
//! ## Terminology
//!
//! - **Tier-1**: bounded in-process LRU, most-recently-used at the tail
//! - **Tier-2**: remote Redis store with a one-hour TTL per entry
//! - **Digest**: lowercase-hex MD5 of the raw query text, the cache key

pub mod lru;
pub mod query;
pub mod redis;

pub use lru::LruCache;
pub use query::{CacheStats, Outcome, QueryCache};
pub use redis::RedisTier;
