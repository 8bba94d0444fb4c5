use metrics::counter;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout};

use crate::config::CacheSettings;
use crate::types::CachedPrediction;

const KEY_NAMESPACE: &str = "pred:";
const KEY_HASH_CHARS: usize = 16;
const MAX_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Uninitialized,
        }
    }
}

/// Cache-aside layer over Redis. The cache is a pure performance
/// optimization: every operation on the request path degrades to a
/// miss or a no-op rather than surfacing an error, so requests behave
/// identically (just slower) with the cache down.
pub struct PredictionCache {
    settings: CacheSettings,
    conn: RwLock<Option<ConnectionManager>>,
    state: AtomicU8,
    permits: Semaphore,
}

#[derive(Debug, Serialize)]
pub struct CacheHealth {
    pub status: &'static str,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_clients: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted_keys: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionCache {
    pub fn new(settings: CacheSettings) -> Self {
        let permits = Semaphore::new(settings.max_in_flight);
        tracing::info!(
            url = %settings.url,
            ttl_secs = settings.ttl.as_secs(),
            "Prediction cache initialized (not connected yet)"
        );
        Self {
            settings,
            conn: RwLock::new(None),
            state: AtomicU8::new(ConnState::Uninitialized as u8),
            permits,
        }
    }

    /// Attempt to establish the connection, retrying with exponential
    /// backoff. Returns `false` (never an error) once retries are
    /// exhausted, leaving the layer Degraded until the next explicit
    /// `connect` call.
    pub async fn connect(&self) -> bool {
        self.set_state(ConnState::Connecting);

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.try_connect().await {
                Ok(manager) => {
                    *self.conn.write().await = Some(manager);
                    self.set_state(ConnState::Connected);
                    tracing::info!("Cache connected");
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        max_attempts = MAX_CONNECT_ATTEMPTS,
                        error = %e,
                        "Cache connection failed"
                    );
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        let wait = std::time::Duration::from_secs(1 << attempt);
                        tracing::warn!(wait_secs = wait.as_secs(), "Retrying cache connection");
                        sleep(wait).await;
                    }
                }
            }
        }

        self.set_state(ConnState::Degraded);
        tracing::error!("Cache connection failed after all retries, continuing degraded");
        false
    }

    async fn try_connect(&self) -> anyhow::Result<ConnectionManager> {
        let client = redis::Client::open(self.settings.url.as_str())?;
        let mut manager =
            timeout(self.settings.op_timeout, ConnectionManager::new(client)).await??;

        let pong: String = timeout(
            self.settings.op_timeout,
            redis::cmd("PING").query_async(&mut manager),
        )
        .await??;
        if pong != "PONG" {
            anyhow::bail!("unexpected ping reply: {pong}");
        }

        Ok(manager)
    }

    /// Cache key: namespace tag plus a truncated SHA-256 of the text.
    /// Raw input never lands in the key space.
    fn cache_key(text: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
        format!("{KEY_NAMESPACE}{}", &digest[..KEY_HASH_CHARS])
    }

    pub fn is_connected(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    async fn connection(&self) -> Option<ConnectionManager> {
        if !self.is_connected() {
            return None;
        }
        self.conn.read().await.clone()
    }

    /// Look up a cached prediction. Absent on degraded state, timeout,
    /// backend error or corrupt payload; corruption also deletes the
    /// entry so the next miss recomputes cleanly.
    pub async fn get(&self, text: &str) -> Option<CachedPrediction> {
        let Some(mut conn) = self.connection().await else {
            tracing::debug!("Cache not connected - miss");
            return None;
        };
        let _permit = self.permits.acquire().await.ok()?;

        let key = Self::cache_key(text);
        match timeout(
            self.settings.op_timeout,
            conn.get::<_, Option<String>>(key.as_str()),
        )
        .await
        {
            Ok(Ok(Some(raw))) => match serde_json::from_str::<CachedPrediction>(&raw) {
                Ok(value) => {
                    counter!("cache_hits_total").increment(1);
                    tracing::debug!(key = %key, "Cache hit");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Corrupt cache entry, deleting");
                    drop(_permit);
                    if !self.delete(text).await {
                        tracing::warn!(key = %key, "Failed to delete corrupt entry");
                    }
                    None
                }
            },
            Ok(Ok(None)) => {
                counter!("cache_misses_total").increment(1);
                tracing::debug!(key = %key, "Cache miss");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Cache read error");
                None
            }
            Err(_) => {
                tracing::warn!(key = %key, "Cache read timed out");
                None
            }
        }
    }

    /// Store a prediction with the configured TTL. Best effort only:
    /// reports success on degraded state, timeout and backend errors so
    /// a cache write can never fail the calling request.
    pub async fn set(&self, text: &str, value: &CachedPrediction) -> bool {
        let Some(mut conn) = self.connection().await else {
            tracing::debug!("Cache not connected - write skipped");
            return true;
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return true;
        };

        let key = Self::cache_key(text);
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Cache value serialization failed");
                return true;
            }
        };

        match timeout(
            self.settings.op_timeout,
            conn.set_ex::<_, _, ()>(key.as_str(), payload, self.settings.ttl.as_secs()),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(key = %key, ttl_secs = self.settings.ttl.as_secs(), "Cache write");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Cache write error");
                true
            }
            Err(_) => {
                tracing::warn!(key = %key, "Cache write timed out");
                true
            }
        }
    }

    /// Operator-invoked deletion; unlike `set`, reports the real outcome.
    pub async fn delete(&self, text: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return false;
        };

        let key = Self::cache_key(text);
        match timeout(self.settings.op_timeout, conn.del::<_, ()>(key.as_str())).await {
            Ok(Ok(())) => {
                tracing::debug!(key = %key, "Cache entry deleted");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Cache delete error");
                false
            }
            Err(_) => {
                tracing::warn!(key = %key, "Cache delete timed out");
                false
            }
        }
    }

    /// Wipe the entire cache database, not just prediction keys.
    /// Operator-invoked; reports the real outcome.
    pub async fn flush_all(&self) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return false;
        };

        match timeout(
            self.settings.op_timeout,
            redis::cmd("FLUSHDB").query_async::<_, ()>(&mut conn),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::warn!("Cache flushed completely");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Cache flush error");
                false
            }
            Err(_) => {
                tracing::error!("Cache flush timed out");
                false
            }
        }
    }

    /// Best-effort introspection for the health endpoints. Failures
    /// degrade to a disconnected/unhealthy payload.
    pub async fn health_check(&self) -> CacheHealth {
        let Some(mut conn) = self.connection().await else {
            return CacheHealth {
                status: "disconnected",
                connected: false,
                used_memory_mb: None,
                connected_clients: None,
                evicted_keys: None,
                error: None,
            };
        };

        match timeout(
            self.settings.op_timeout,
            redis::cmd("INFO").query_async::<_, redis::InfoDict>(&mut conn),
        )
        .await
        {
            Ok(Ok(info)) => CacheHealth {
                status: "healthy",
                connected: true,
                used_memory_mb: info
                    .get::<u64>("used_memory")
                    .map(|bytes| bytes as f64 / 1024.0 / 1024.0),
                connected_clients: info.get("connected_clients"),
                evicted_keys: info.get("evicted_keys"),
                error: None,
            },
            Ok(Err(e)) => unhealthy(e.to_string()),
            Err(_) => unhealthy("health check timed out".to_string()),
        }
    }

    pub async fn close(&self) {
        *self.conn.write().await = None;
        self.set_state(ConnState::Uninitialized);
        tracing::info!("Cache connection closed");
    }
}

fn unhealthy(error: String) -> CacheHealth {
    CacheHealth {
        status: "unhealthy",
        connected: false,
        used_memory_mb: None,
        connected_clients: None,
        evicted_keys: None,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn disconnected_cache() -> PredictionCache {
        PredictionCache::new(CacheSettings {
            url: "redis://localhost:6379".to_string(),
            ttl: Duration::from_secs(3600),
            op_timeout: Duration::from_secs(5),
            max_in_flight: 4,
        })
    }

    fn sample_value() -> CachedPrediction {
        CachedPrediction {
            label: "TECHNOLOGY".to_string(),
            confidence: 0.91,
            distribution: BTreeMap::from([
                ("TECHNOLOGY".to_string(), 0.91),
                ("BUSINESS".to_string(), 0.09),
            ]),
        }
    }

    #[test]
    fn key_is_deterministic_and_namespaced() {
        let a = PredictionCache::cache_key("Apple releases new iPhone");
        let b = PredictionCache::cache_key("Apple releases new iPhone");
        assert_eq!(a, b);
        assert!(a.starts_with(KEY_NAMESPACE));
        assert_eq!(a.len(), KEY_NAMESPACE.len() + KEY_HASH_CHARS);
    }

    #[test]
    fn distinct_texts_get_distinct_keys() {
        let a = PredictionCache::cache_key("Apple releases new iPhone");
        let b = PredictionCache::cache_key("Apple releases new iPhone!");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn degraded_get_is_a_miss() {
        let cache = disconnected_cache();
        assert!(cache.get("anything").await.is_none());
    }

    #[tokio::test]
    async fn degraded_set_reports_success() {
        let cache = disconnected_cache();
        assert!(cache.set("anything", &sample_value()).await);
    }

    #[tokio::test]
    async fn degraded_admin_ops_report_failure() {
        let cache = disconnected_cache();
        assert!(!cache.delete("anything").await);
        assert!(!cache.flush_all().await);
    }

    #[tokio::test]
    async fn degraded_health_reports_disconnected() {
        let cache = disconnected_cache();
        let health = cache.health_check().await;
        assert_eq!(health.status, "disconnected");
        assert!(!health.connected);
    }
}
