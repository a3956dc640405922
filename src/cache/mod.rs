//! Ephemeral caching: session bindings and sliding-window rate limits
//!
//! Backed by redis when configured, with an in-process fallback that takes
//! over per-operation whenever the external cache errors or exceeds its
//! 500 ms budget. Cached data is never the source of truth; reads tolerate
//! eviction, writes tolerate loss.

use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{ErrorCode, GovError, GovResult};

/// Budget for any single external-cache operation.
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(3600);

async fn bounded<T, F>(op: F) -> Option<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(CACHE_OP_TIMEOUT, op).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "external cache error, falling back in-process");
            None
        }
        Err(_) => {
            tracing::warn!("external cache timed out, falling back in-process");
            None
        }
    }
}

/// Connect to the external cache, degrading to in-process only on failure.
pub async fn connect_external(url: &str) -> Option<ConnectionManager> {
    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "invalid cache url, running without external cache");
            return None;
        }
    };
    match tokio::time::timeout(Duration::from_secs(3), ConnectionManager::new(client)).await {
        Ok(Ok(conn)) => Some(conn),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "external cache unreachable, running in-process");
            None
        }
        Err(_) => {
            tracing::warn!("external cache connect timed out, running in-process");
            None
        }
    }
}

/// Fast `session_key -> agent_uuid` lookup with TTL extended on touch.
pub struct SessionCache {
    external: Option<ConnectionManager>,
    local: DashMap<String, (Uuid, Instant)>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(external: Option<ConnectionManager>, ttl: Duration) -> Self {
        Self {
            external,
            local: DashMap::new(),
            ttl,
        }
    }

    /// In-process only; used by tests and cache-disabled deployments.
    pub fn in_process(ttl: Duration) -> Self {
        Self::new(None, ttl)
    }

    fn key(session_key: &str) -> String {
        format!("agentgov:session:{}", session_key)
    }

    /// Look up a binding, extending its TTL on hit.
    pub async fn get(&self, session_key: &str) -> Option<Uuid> {
        if let Some(conn) = &self.external {
            let mut conn = conn.clone();
            let key = Self::key(session_key);
            let ttl = self.ttl.as_secs() as i64;
            let found: Option<Option<String>> = bounded(async move {
                let value: Option<String> = conn.get(&key).await?;
                if value.is_some() {
                    let _: bool = conn.expire(&key, ttl).await?;
                }
                Ok(value)
            })
            .await;
            if let Some(value) = found {
                return value.and_then(|v| Uuid::parse_str(&v).ok());
            }
        }

        let mut entry = self.local.get_mut(session_key)?;
        if entry.1 < Instant::now() {
            drop(entry);
            self.local.remove(session_key);
            return None;
        }
        entry.1 = Instant::now() + self.ttl;
        Some(entry.0)
    }

    /// Bind a session key. Writes both layers; external loss is tolerated.
    pub async fn put(&self, session_key: &str, uuid: Uuid) {
        if let Some(conn) = &self.external {
            let mut conn = conn.clone();
            let key = Self::key(session_key);
            let ttl = self.ttl.as_secs();
            let value = uuid.to_string();
            let _: Option<()> = bounded(async move { conn.set_ex(&key, value, ttl).await }).await;
        }
        self.local
            .insert(session_key.to_string(), (uuid, Instant::now() + self.ttl));
    }

    pub async fn invalidate(&self, session_key: &str) {
        if let Some(conn) = &self.external {
            let mut conn = conn.clone();
            let key = Self::key(session_key);
            let _: Option<()> = bounded(async move { conn.del(&key).await }).await;
        }
        self.local.remove(session_key);
    }
}

/// Sliding-window counter per `(agent_uuid, operation_class)`.
pub struct RateLimiter {
    external: Option<ConnectionManager>,
    local: DashMap<(Uuid, String), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(external: Option<ConnectionManager>) -> Self {
        Self {
            external,
            local: DashMap::new(),
        }
    }

    pub fn in_process() -> Self {
        Self::new(None)
    }

    /// Record one hit and fail with `RATE_LIMITED` when the window is full.
    pub async fn check(&self, uuid: Uuid, class: &str, limit: u32) -> GovResult<()> {
        if let Some(conn) = &self.external {
            let mut conn = conn.clone();
            let key = format!("agentgov:rate:{}:{}", uuid, class);
            let now_us = chrono::Utc::now().timestamp_micros();
            let window_start = now_us - RATE_WINDOW.as_micros() as i64;
            let count: Option<i64> = bounded(async move {
                let _: i64 = conn.zrembyscore(&key, i64::MIN, window_start).await?;
                let _: i64 = conn.zadd(&key, now_us, now_us).await?;
                let _: bool = conn.expire(&key, RATE_WINDOW.as_secs() as i64).await?;
                conn.zcard(&key).await
            })
            .await;
            if let Some(count) = count {
                return Self::verdict(uuid, class, count as u64, limit);
            }
        }

        let now = Instant::now();
        let mut window = self
            .local
            .entry((uuid, class.to_string()))
            .or_insert_with(VecDeque::new);
        while window
            .front()
            .map_or(false, |t| now.duration_since(*t) > RATE_WINDOW)
        {
            window.pop_front();
        }
        window.push_back(now);
        Self::verdict(uuid, class, window.len() as u64, limit)
    }

    fn verdict(uuid: Uuid, class: &str, count: u64, limit: u32) -> GovResult<()> {
        if count > limit as u64 {
            return Err(GovError::new(
                ErrorCode::RateLimited,
                format!("rate limit exceeded for {}: {}/hour", class, limit),
            )
            .with_details(serde_json::json!({
                "agent_uuid": uuid,
                "operation_class": class,
                "limit_per_hour": limit,
            }))
            .with_recovery(["retry after the window slides"]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_cache_roundtrip() {
        let cache = SessionCache::in_process(Duration::from_secs(60));
        let uuid = Uuid::new_v4();
        cache.put("sess-1", uuid).await;
        assert_eq!(cache.get("sess-1").await, Some(uuid));
        assert_eq!(cache.get("sess-2").await, None);
        cache.invalidate("sess-1").await;
        assert_eq!(cache.get("sess-1").await, None);
    }

    #[tokio::test]
    async fn test_session_cache_expiry() {
        let cache = SessionCache::in_process(Duration::from_millis(10));
        let uuid = Uuid::new_v4();
        cache.put("sess", uuid).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("sess").await, None);
    }

    #[tokio::test]
    async fn test_rate_limiter_enforces_window() {
        let limiter = RateLimiter::in_process();
        let uuid = Uuid::new_v4();
        for _ in 0..5 {
            limiter.check(uuid, "knowledge_note", 5).await.unwrap();
        }
        let err = limiter.check(uuid, "knowledge_note", 5).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimited);

        // A different class or agent has its own window.
        limiter.check(uuid, "other_class", 5).await.unwrap();
        limiter
            .check(Uuid::new_v4(), "knowledge_note", 5)
            .await
            .unwrap();
    }
}
