//! Two-tier memoization of query responses, fronted by single-flight.

use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::lru::LruCache;
use crate::cache::redis::RedisTier;
use crate::config::CacheConfig;
use crate::flight::{Role, SingleFlight};

/// How a query entered the flight path.
pub enum Outcome {
    /// The response was already memoized; no upstream work is needed.
    CacheHit(Bytes),
    /// The caller owns the upstream execution for this query.
    Leader,
    /// Another session is executing this query; the receiver yields its
    /// response.
    Waiter(oneshot::Receiver<Bytes>),
}

/// Cache counters. `l1_size` is filled in when a snapshot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l1_size: usize,
}

/// Process-wide query response cache: a bounded in-process LRU over an
/// optional Redis tier, with a single-flight coordinator in front.
///
/// Keys are the lowercase-hex MD5 of the raw query text.
pub struct QueryCache {
    l1: Option<RwLock<LruCache>>,
    l2: Option<RedisTier>,
    flights: SingleFlight,
    stats: Mutex<CacheStats>,
}

impl QueryCache {
    /// Builds the cache from configuration. A Tier-2 connection failure
    /// degrades to an L1-only cache; the proxy keeps running.
    pub async fn new(config: &CacheConfig) -> Self {
        let l1 = config
            .l1
            .enabled
            .then(|| RwLock::new(LruCache::new(config.l1.max_size)));

        let l2 = if config.l2.redis.enabled {
            match RedisTier::connect(&config.l2.redis).await {
                Ok(tier) => Some(tier),
                Err(e) => {
                    warn!(error = %e, "redis unavailable, tier-2 disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            l1,
            l2,
            flights: SingleFlight::new(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Digest of a query: deterministic across processes for the same text.
    pub fn hash_query(query: &str) -> String {
        format!("{:x}", Md5::digest(query.as_bytes()))
    }

    /// Looks up a memoized response. A Tier-2 hit that missed Tier-1 is
    /// promoted into Tier-1 on the way out.
    pub async fn get(&self, query: &str) -> Option<Bytes> {
        let key = Self::hash_query(query);

        if let Some(hit) = self.get_l1(&key) {
            self.record(true, None);
            return Some(hit);
        }

        if let Some(tier) = self.l2.as_ref().filter(|t| t.is_enabled()) {
            if let Some(value) = tier.get(&key).await {
                let value = Bytes::from(value);
                self.put_l1(&key, &value);
                self.record(false, Some(true));
                return Some(value);
            }
            self.record(false, Some(false));
            return None;
        }

        self.record(false, None);
        None
    }

    /// Memoizes a response in both tiers.
    pub async fn put(&self, query: &str, response: Bytes) {
        let key = Self::hash_query(query);
        self.put_l1(&key, &response);
        if let Some(tier) = self.l2.as_ref().filter(|t| t.is_enabled()) {
            tier.set(&key, &response).await;
        }
    }

    /// Front door for the leader/waiter protocol: a memoized response wins
    /// outright; otherwise the coordinator decides who executes upstream.
    pub async fn do_single_flight(&self, query: &str) -> Outcome {
        if let Some(cached) = self.get(query).await {
            debug!(query, "cache hit");
            return Outcome::CacheHit(cached);
        }
        match self.flights.begin(&Self::hash_query(query)) {
            Role::Leader => Outcome::Leader,
            Role::Waiter(rx) => Outcome::Waiter(rx),
        }
    }

    /// Publishes the leader's response: memoize, then multicast to waiters.
    pub async fn notify_flight_result(&self, query: &str, response: Bytes) {
        self.put(query, response.clone()).await;
        self.flights.notify(&Self::hash_query(query), response);
    }

    /// Drops Tier-1, flushes Tier-2, resets the counters.
    pub async fn clear(&self) {
        if let Some(l1) = self.l1.as_ref() {
            l1.write().clear();
        }
        if let Some(tier) = self.l2.as_ref() {
            tier.flush().await;
        }
        *self.stats.lock() = CacheStats::default();
        debug!("cache cleared");
    }

    /// Snapshot of the counters plus the live Tier-1 size.
    pub fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.lock();
        stats.l1_size = self.l1.as_ref().map_or(0, |l1| l1.read().len());
        stats
    }

    fn get_l1(&self, key: &str) -> Option<Bytes> {
        let l1 = self.l1.as_ref()?;
        // Cheap shared probe first; the recency splice needs the write lock.
        if !l1.read().contains(key) {
            return None;
        }
        l1.write().get(key)
    }

    fn put_l1(&self, key: &str, value: &Bytes) {
        if let Some(l1) = self.l1.as_ref() {
            l1.write().put(key.to_string(), value.clone());
        }
    }

    /// Every `get` ticks exactly one l1 counter and, on an l1 miss, exactly
    /// one l2 counter iff Tier-2 was consulted.
    fn record(&self, l1_hit: bool, l2_hit: Option<bool>) {
        let mut stats = self.stats.lock();
        if l1_hit {
            stats.l1_hits += 1;
        } else {
            stats.l1_misses += 1;
        }
        match l2_hit {
            Some(true) => stats.l2_hits += 1,
            Some(false) => stats.l2_misses += 1,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn l1_only_cache() -> QueryCache {
        // Defaults: L1 enabled with bound 1000, Tier-2 off.
        QueryCache::new(&CacheConfig::default()).await
    }

    #[test]
    fn test_hash_is_deterministic_and_lowercase_hex() {
        let digest = QueryCache::hash_query("SELECT 1");
        assert_eq!(digest, QueryCache::hash_query("SELECT 1"));
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!digest.chars().any(|c| c.is_ascii_uppercase()));
        assert_ne!(digest, QueryCache::hash_query("SELECT 2"));
        // Known MD5 vector, stable across processes and releases.
        assert_eq!(
            QueryCache::hash_query(""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let cache = l1_only_cache().await;
        cache.put("SELECT 1", Bytes::from_static(b"XREPLY")).await;
        assert_eq!(
            cache.get("SELECT 1").await,
            Some(Bytes::from_static(b"XREPLY"))
        );
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let cache = l1_only_cache().await;
        cache.put("q", Bytes::from_static(b"r")).await;
        cache.clear().await;
        assert_eq!(cache.get("q").await, None);
        assert_eq!(cache.stats().l1_misses, 1);
    }

    #[tokio::test]
    async fn test_stats_tick_once_per_get() {
        let cache = l1_only_cache().await;

        assert_eq!(cache.get("q").await, None);
        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 0);
        assert_eq!(stats.l1_misses, 1);
        // Tier-2 is off: its counters never move.
        assert_eq!(stats.l2_hits, 0);
        assert_eq!(stats.l2_misses, 0);

        cache.put("q", Bytes::from_static(b"r")).await;
        assert!(cache.get("q").await.is_some());
        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l1_misses, 1);
        assert_eq!(stats.l1_size, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_outcome() {
        let cache = l1_only_cache().await;
        cache.put("SELECT 1", Bytes::from_static(b"XREPLY")).await;
        match cache.do_single_flight("SELECT 1").await {
            Outcome::CacheHit(bytes) => assert_eq!(bytes, Bytes::from_static(b"XREPLY")),
            _ => panic!("expected a cache hit"),
        }
    }

    #[tokio::test]
    async fn test_leader_then_waiter_then_notify() {
        let cache = l1_only_cache().await;

        assert!(matches!(
            cache.do_single_flight("SELECT x").await,
            Outcome::Leader
        ));
        let Outcome::Waiter(rx) = cache.do_single_flight("SELECT x").await else {
            panic!("expected a waiter");
        };

        cache
            .notify_flight_result("SELECT x", Bytes::from_static(b"RESP"))
            .await;

        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"RESP"));
        // The response is memoized; the next caller hits the cache.
        assert!(matches!(
            cache.do_single_flight("SELECT x").await,
            Outcome::CacheHit(_)
        ));
    }

    #[tokio::test]
    async fn test_l1_disabled_stores_nothing() {
        let mut config = CacheConfig::default();
        config.l1.enabled = false;
        let cache = QueryCache::new(&config).await;

        cache.put("q", Bytes::from_static(b"r")).await;
        assert_eq!(cache.get("q").await, None);
        assert_eq!(cache.stats().l1_size, 0);
    }

    #[tokio::test]
    async fn test_l1_bound_is_honored_through_the_cache() {
        let mut config = CacheConfig::default();
        config.l1.max_size = 3;
        let cache = QueryCache::new(&config).await;

        for i in 1..=4 {
            cache
                .put(&format!("q{}", i), Bytes::from_static(b"r"))
                .await;
        }
        assert_eq!(cache.stats().l1_size, 3);
        assert_eq!(cache.get("q1").await, None);
        assert!(cache.get("q2").await.is_some());
        assert!(cache.get("q3").await.is_some());
        assert!(cache.get("q4").await.is_some());
    }
}
