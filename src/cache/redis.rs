//! Tier-2 Redis tier for memoized query responses.
//!
//! Failures never surface to the data plane: a failed probe triggers one
//! teardown-and-reconnect under the exclusive branch and one retry; if the
//! reconnect fails the tier disables itself and everything afterwards is a
//! cache miss until the proxy is reconfigured.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;

/// Namespace prefix for memoized responses.
const KEY_PREFIX: &str = "query:";

/// Time-to-live for memoized responses, in seconds.
const RESPONSE_TTL_SECS: u64 = 3600;

/// Remote key-value tier.
pub struct RedisTier {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    enabled: AtomicBool,
    connect_timeout: Duration,
}

impl RedisTier {
    /// Connects to the configured server. A connection failure returns the
    /// tier disabled rather than an error; the proxy runs without it.
    pub async fn connect(config: &RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(format!("redis://{}:{}/", config.host, config.port))?;
        let tier = Self {
            client,
            conn: RwLock::new(None),
            enabled: AtomicBool::new(true),
            connect_timeout: Duration::from_millis(config.timeout_ms),
        };

        match tier.open_connection().await {
            Ok(conn) => {
                *tier.conn.write().await = Some(conn);
                info!(host = %config.host, port = config.port, "redis connected");
            }
            Err(e) => {
                warn!(error = %e, "redis connection failed, tier-2 disabled");
                tier.enabled.store(false, Ordering::SeqCst);
            }
        }
        Ok(tier)
    }

    /// Whether the tier is still serving lookups.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Fetches the response bytes stored for `digest`, or a miss.
    pub async fn get(&self, digest: &str) -> Option<Vec<u8>> {
        if !self.is_enabled() {
            return None;
        }
        let key = Self::namespaced(digest);

        if let Some(mut conn) = self.current_connection().await {
            match conn.get::<_, Option<Vec<u8>>>(&key).await {
                Ok(value) => return value,
                Err(e) => debug!(error = %e, "redis GET failed, reconnecting"),
            }
        }

        let mut conn = self.reconnect().await?;
        match conn.get::<_, Option<Vec<u8>>>(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "redis GET retry failed, tier-2 disabled");
                self.enabled.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Stores the response bytes for `digest` with the standard TTL.
    pub async fn set(&self, digest: &str, value: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let key = Self::namespaced(digest);

        if let Some(mut conn) = self.current_connection().await {
            match conn.set_ex::<_, _, ()>(&key, value, RESPONSE_TTL_SECS).await {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "redis SETEX failed, reconnecting"),
            }
        }

        let Some(mut conn) = self.reconnect().await else {
            return;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, value, RESPONSE_TTL_SECS).await {
            warn!(error = %e, "redis SETEX retry failed, tier-2 disabled");
            self.enabled.store(false, Ordering::SeqCst);
        }
    }

    /// Flushes the backing database.
    pub async fn flush(&self) {
        if !self.is_enabled() {
            return;
        }
        let Some(mut conn) = self.current_connection().await else {
            return;
        };
        if let Err(e) = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
            warn!(error = %e, "redis FLUSHDB failed");
        }
    }

    fn namespaced(digest: &str) -> String {
        format!("{}{}", KEY_PREFIX, digest)
    }

    /// Clones the live connection handle under the shared branch.
    async fn current_connection(&self) -> Option<MultiplexedConnection> {
        self.conn.read().await.clone()
    }

    /// Tears down and re-establishes the connection under the exclusive
    /// branch. Failure disables the tier.
    async fn reconnect(&self) -> Option<MultiplexedConnection> {
        let mut guard = self.conn.write().await;
        *guard = None;
        match self.open_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                info!("redis reconnected");
                Some(conn)
            }
            Err(e) => {
                warn!(error = %e, "redis reconnect failed, tier-2 disabled");
                self.enabled.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    async fn open_connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| redis::RedisError::from((redis::ErrorKind::IoError, "connect timed out")))?
    }
}
