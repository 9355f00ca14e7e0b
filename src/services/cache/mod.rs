use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

pub fn feature_key(user_id: &str) -> String {
    format!("user:features:{}", user_id)
}

pub fn recommendations_key(user_id: &str, context: &str) -> String {
    format!("recommendations:{}:{}", user_id, context)
}

pub fn recommendations_prefix(user_id: &str) -> String {
    format!("recommendations:{}:", user_id)
}

pub fn processed_request_key(request_id: &str) -> String {
    format!("processed_request:{}", request_id)
}

/// Key-value cache with per-entry TTL. Backs the feature cache, the
/// recommendation cache, idempotency markers, and the catalog cache.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_by_prefix(&self, prefix: &str) -> Result<()>;
}

pub struct RedisCache {
    client: Arc<redis::Client>,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        info!("redis cache initialized");
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.client.get_async_connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}

/// In-memory cache holding explicit (value, expiry) pairs, checked on read.
/// The clock can be advanced manually so tests can simulate TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    clock_offset_secs: AtomicI64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(self.clock_offset_secs.load(Ordering::Relaxed))
    }

    /// Shifts the cache's view of the current time forward.
    pub fn advance_secs(&self, secs: i64) {
        self.clock_offset_secs.fetch_add(secs, Ordering::Relaxed);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expiry)) if *expiry <= now => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()> {
        let expiry = self.now() + Duration::seconds(ttl_seconds as i64);
        self.entries.lock().insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        self.entries.lock().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
