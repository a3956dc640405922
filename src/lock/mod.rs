//! Named write-locks keyed by agent uuid
//!
//! Auto-expiry is mandatory so a crashed holder cannot deadlock the agent;
//! operations that legitimately outlive the TTL renew periodically. Two
//! backends: expiring redis keys for clusters, an in-process registry
//! otherwise.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{GovError, GovResult};

/// How long `acquire` keeps trying before failing `CONTENTION`.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// An exclusive hold on a named lock. Dropping without `release` leaves the
/// key to expire on its own.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Extend the expiry; required for operations outliving the TTL.
    async fn renew(&mut self, ttl: Duration) -> GovResult<()>;
    /// Release early instead of waiting for expiry.
    async fn release(self: Box<Self>) -> GovResult<()>;
}

/// Lock service capability. Only one holder per name at a time.
#[async_trait]
pub trait NamedLock: Send + Sync {
    async fn acquire(&self, name: &str, ttl: Duration) -> GovResult<Box<dyn LockHandle>>;

    /// Reap entries whose expiry has passed; returns how many were removed.
    /// The redis backend expires keys natively and reaps nothing.
    async fn cleanup_stale(&self) -> GovResult<usize>;
}

/// Pick the backend: cluster locks when an external cache is connected,
/// in-process otherwise.
pub fn lock_service(external: Option<ConnectionManager>) -> Arc<dyn NamedLock> {
    match external {
        Some(conn) => Arc::new(RedisLockService::new(conn)),
        None => Arc::new(LocalLockService::new()),
    }
}

// --- redis backend ---

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end"#;

pub struct RedisLockService {
    conn: ConnectionManager,
}

impl RedisLockService {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(name: &str) -> String {
        format!("agentgov:lock:{}", name)
    }
}

#[async_trait]
impl NamedLock for RedisLockService {
    async fn acquire(&self, name: &str, ttl: Duration) -> GovResult<Box<dyn LockHandle>> {
        let key = Self::key(name);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;

        loop {
            let mut conn = self.conn.clone();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(Box::new(RedisLockHandle {
                    conn: self.conn.clone(),
                    key,
                    token,
                }));
            }
            if Instant::now() >= deadline {
                return Err(GovError::contention(name));
            }
            tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
        }
    }

    async fn cleanup_stale(&self) -> GovResult<usize> {
        Ok(0)
    }
}

struct RedisLockHandle {
    conn: ConnectionManager,
    key: String,
    token: String,
}

#[async_trait]
impl LockHandle for RedisLockHandle {
    async fn renew(&mut self, ttl: Duration) -> GovResult<()> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if renewed == 0 {
            return Err(GovError::contention(&self.key));
        }
        Ok(())
    }

    async fn release(self: Box<Self>) -> GovResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

// --- in-process backend ---

#[derive(Clone)]
struct LocalEntry {
    token: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
pub struct LocalLockService {
    entries: Arc<DashMap<String, LocalEntry>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, name: &str, ttl: Duration) -> Option<Uuid> {
        let token = Uuid::new_v4();
        let now = Instant::now();
        let mut taken = false;
        let entry = self
            .entries
            .entry(name.to_string())
            .and_modify(|existing| {
                if existing.expires_at <= now {
                    existing.token = token;
                    existing.expires_at = now + ttl;
                    taken = true;
                }
            })
            .or_insert_with(|| {
                taken = true;
                LocalEntry {
                    token,
                    expires_at: now + ttl,
                }
            });
        let held = entry.token;
        drop(entry);
        (taken && held == token).then_some(token)
    }
}

#[async_trait]
impl NamedLock for LocalLockService {
    async fn acquire(&self, name: &str, ttl: Duration) -> GovResult<Box<dyn LockHandle>> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if let Some(token) = self.try_take(name, ttl) {
                return Ok(Box::new(LocalLockHandle {
                    entries: Arc::clone(&self.entries),
                    name: name.to_string(),
                    token,
                }));
            }
            if Instant::now() >= deadline {
                return Err(GovError::contention(name));
            }
            tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
        }
    }

    async fn cleanup_stale(&self) -> GovResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - self.entries.len())
    }
}

struct LocalLockHandle {
    entries: Arc<DashMap<String, LocalEntry>>,
    name: String,
    token: Uuid,
}

#[async_trait]
impl LockHandle for LocalLockHandle {
    async fn renew(&mut self, ttl: Duration) -> GovResult<()> {
        let mut renewed = false;
        if let Some(mut entry) = self.entries.get_mut(&self.name) {
            if entry.token == self.token {
                entry.expires_at = Instant::now() + ttl;
                renewed = true;
            }
        }
        if renewed {
            Ok(())
        } else {
            Err(GovError::contention(&self.name))
        }
    }

    async fn release(self: Box<Self>) -> GovResult<()> {
        self.entries
            .remove_if(&self.name, |_, entry| entry.token == self.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_local_lock_excludes_second_holder() {
        let service = LocalLockService::new();
        let held = service
            .acquire("agent-1", Duration::from_secs(30))
            .await
            .unwrap();

        // Second acquire cannot succeed while held; probe directly instead
        // of waiting out the 5 s acquire timeout.
        assert!(service.try_take("agent-1", Duration::from_secs(30)).is_none());

        held.release().await.unwrap();
        let reacquired = service.acquire("agent-1", Duration::from_secs(30)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_local_lock_expires() {
        let service = LocalLockService::new();
        let _held = service
            .acquire("agent-1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Expired hold is taken over without release.
        assert!(service.try_take("agent-1", Duration::from_secs(30)).is_some());
    }

    #[tokio::test]
    async fn test_local_lock_renew_extends() {
        let service = LocalLockService::new();
        let mut held = service
            .acquire("agent-1", Duration::from_millis(40))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        held.renew(Duration::from_secs(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(service.try_take("agent-1", Duration::from_secs(30)).is_none());
    }

    #[tokio::test]
    async fn test_release_after_expiry_does_not_steal() {
        let service = LocalLockService::new();
        let stale = service
            .acquire("agent-1", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _fresh = service
            .acquire("agent-1", Duration::from_secs(30))
            .await
            .unwrap();
        // The stale handle's release must not remove the fresh holder.
        stale.release().await.unwrap();
        assert!(service.try_take("agent-1", Duration::from_secs(30)).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_stale_reaps_expired_entries() {
        let service = LocalLockService::new();
        let _a = service
            .acquire("agent-1", Duration::from_millis(10))
            .await
            .unwrap();
        let _b = service
            .acquire("agent-2", Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.cleanup_stale().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_holder() {
        let service = Arc::new(LocalLockService::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                service.try_take("agent-1", Duration::from_secs(30)).is_some()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_contention_error_code() {
        let err = GovError::contention("agent-1");
        assert_eq!(err.code, ErrorCode::Contention);
    }
}
