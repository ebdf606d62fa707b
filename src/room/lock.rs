//! Mutual exclusion scoped to a string key, shared across processes through
//! the same backend as the room store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};

use crate::room::error::LockError;

/// Default time to wait for a held lock before giving up.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lease; a holder that dies keeps the key at most this long.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Pause between acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Compare-and-delete so a holder whose lease expired can't free a newer owner.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Backend primitive: a single non-blocking attempt plus owner-checked release.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Returns `true` if `key` is now held under `token`.
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration)
        -> Result<bool, LockError>;

    /// Frees `key` if it is still held under `token`; otherwise does nothing.
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;
}

/// Redis lock using `SET NX PX` and a compare-and-delete release.
pub struct RedisLockBackend {
    redis_client: Arc<redis::Client>,
    release_script: redis::Script,
}

impl RedisLockBackend {
    pub fn new(redis_client: Arc<redis::Client>) -> Self {
        Self {
            redis_client,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        // "OK" when set, nil when the key is already held
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Process-local lock table with the same lease semantics as the Redis one.
#[derive(Default)]
pub struct MemoryLockBackend {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let mut held = self.table()?;
        let now = Instant::now();
        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), (token.to_string(), now + lease));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut held = self.table()?;
        if held.get(key).is_some_and(|(owner, _)| owner == token) {
            held.remove(key);
        }
        Ok(())
    }
}

/// Blocking-with-timeout lock over a [`LockBackend`].
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    blocking_timeout: Duration,
    lease: Duration,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_blocking_timeout(mut self, blocking_timeout: Duration) -> Self {
        self.blocking_timeout = blocking_timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn blocking_timeout(&self) -> Duration {
        self.blocking_timeout
    }

    /// Waits up to the blocking timeout for `key`.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.blocking_timeout;

        loop {
            if self.backend.try_acquire(key, &token, self.lease).await? {
                debug!("Lock {} acquired after {:?}", key, started.elapsed());
                return Ok(LockGuard {
                    backend: self.backend.clone(),
                    key: key.to_string(),
                    token,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Lock {} not acquired within {:?}", key, self.blocking_timeout);
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: self.blocking_timeout,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Runs `work` while holding `key`. The lock is released whether the work
    /// succeeds, fails, or the returned future is dropped mid-way.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.acquire(key).await?;
        let result = work().await;
        guard.release().await;
        result
    }
}

/// A held lock. Dropping it without calling [`LockGuard::release`] schedules
/// the release on the current runtime.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.backend.release(&self.key, &self.token).await {
            warn!("Failed to release lock {}: {}", self.key, e);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.release(&key, &token).await {
                        warn!("Failed to release dropped lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime; lease will expire it", key),
        }
    }
}
