// botsift/src/cache.rs
//
// Prediction cache. Verdicts are stored as "1" (bot) or "-1" (human) under
// two keys per prediction:
//
//   <address>          bare client address
//   <host>/<address>   composite key
//
// Production uses Redis through a ConnectionManager (reconnects on its own);
// the in-memory backend serves tests and single-process deployments.
// ConnectionManager has no response timeout of its own, so every call from
// the engine and the verdict responder goes through `bounded`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::events::{ClassLabel, Key};

#[async_trait]
pub trait PredictionCache: Send + Sync {
    async fn set(&self, key: &str, value: i64) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<i64>>;
}

/// Run one cache call under `limit`. Elapsed counts as Unavailable.
pub async fn bounded<T>(limit: Duration, op: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, op).await {
        Ok(r)  => r,
        Err(_) => Err(EngineError::unavailable("cache", format!("no reply within {:?}", limit))),
    }
}

/// Publish `label` for `key` under both granularities, each write bounded by
/// `limit`. Unknown is not published.
pub async fn publish(
    cache: &dyn PredictionCache,
    key:   &Key,
    label: ClassLabel,
    limit: Duration,
) -> Result<bool> {
    let Some(value) = label.cache_value() else {
        return Ok(false);
    };
    bounded(limit, cache.set(&key.address, value)).await?;
    bounded(limit, cache.set(&key.composite(), value)).await?;
    debug!(key = %key, value, "verdict published");
    Ok(true)
}

// ── Redis ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PredictionCache for RedisCache {
    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| match s.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, "non-numeric cache value {:?}", s);
                None
            }
        }))
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCache {
    map: DashMap<String, i64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl PredictionCache for MemoryCache {
    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.map.get(key).map(|v| *v))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Backend that accepts calls and never answers.
    pub struct HungCache;

    #[async_trait]
    impl PredictionCache for HungCache {
        async fn set(&self, _key: &str, _value: i64) -> Result<()> {
            std::future::pending().await
        }
        async fn get(&self, _key: &str) -> Result<Option<i64>> {
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::HungCache;
    use super::*;
    use crate::error::ErrorKind;

    const LIMIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn publish_writes_both_keys() {
        let cache = MemoryCache::new();
        let key = Key::new("shop.example", "192.0.2.7");
        assert!(publish(&cache, &key, ClassLabel::Human, LIMIT).await.unwrap());

        assert_eq!(cache.get("192.0.2.7").await.unwrap(), Some(-1));
        assert_eq!(cache.get("shop.example/192.0.2.7").await.unwrap(), Some(-1));
        assert_eq!(cache.len(), 2);

        publish(&cache, &key, ClassLabel::Bot, LIMIT).await.unwrap();
        assert_eq!(cache.get("192.0.2.7").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn unknown_is_not_published() {
        let cache = MemoryCache::new();
        let key = Key::new("h", "192.0.2.8");
        assert!(!publish(&cache, &key, ClassLabel::Unknown, LIMIT).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        let key = Key::new("h", "192.0.2.9");
        let started = tokio::time::Instant::now();
        let err = publish(&HungCache, &key, ClassLabel::Bot, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
