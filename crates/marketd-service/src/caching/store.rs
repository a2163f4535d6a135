use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

/// A failure talking to the shared store.
///
/// Callers uniformly treat this as "store unavailable" and fail open: reads
/// fall through to direct producer calls, lock acquisition trivially
/// succeeds, writes are dropped.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Key count under the service's namespace, logged at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: u64,
}

/// The shared key-value store behind the cache.
///
/// Keys and values are opaque strings here; record encoding and key
/// derivation live with the callers. TTLs are physical: when one elapses the
/// key is gone for every reader.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value` with a physical TTL, overwriting any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Resets the physical TTL of an existing key. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Deletes every key matching a glob pattern, returning the count.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Atomically takes the lock `key` for `hold` unless already held.
    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        hold: Duration,
    ) -> Result<bool, StoreError>;

    /// Releases the lock `key`, but only if it still carries `token`.
    async fn release_lock(&self, key: &str, token: &str) -> Result<(), StoreError>;

    async fn stats(&self, pattern: &str) -> Result<StoreStats, StoreError>;
}

/// Compare-and-delete so an expired-and-reacquired lock is never released
/// by its previous holder.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

/// [`Store`] backed by a Redis server.
///
/// The connection is established lazily so the service comes up (and fails
/// open) even while Redis is unreachable.
pub struct RedisStore {
    client: redis::Client,
    manager: tokio::sync::OnceCell<ConnectionManager>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        Ok(RedisStore {
            client: redis::Client::open(url)?,
            manager: tokio::sync::OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.connection().await?;
        let value: Option<String> = con.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.connection().await?;
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.connection().await?;
        let _: bool = con.pexpire(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.connection().await?;
        let deleted: u64 = con.del(&keys).await?;
        Ok(deleted)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        hold: Duration,
    ) -> Result<bool, StoreError> {
        let mut con = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(hold.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut con = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn stats(&self, pattern: &str) -> Result<StoreStats, StoreError> {
        let keys = self.scan_keys(pattern).await?;
        Ok(StoreStats {
            keys: keys.len() as u64,
        })
    }
}

/// In-process [`Store`] honoring TTLs, for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<R>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> R) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        f(&mut entries)
    }
}

/// Matches a redis-style glob where `*` is the only wildcard.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match p.split_first() {
            None => k.is_empty(),
            Some((b'*', rest)) => {
                (0..=k.len()).any(|skip| inner(rest, &k[skip..]))
            }
            Some((c, rest)) => k.split_first().is_some_and(|(kc, krest)| kc == c && inner(rest, krest)),
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_live(|entries| entries.get(key).map(|(value, _)| value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_live(|entries| {
            entries.insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_live(|entries| {
            if let Some((_, deadline)) = entries.get_mut(key) {
                *deadline = Instant::now() + ttl;
            }
        });
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        Ok(self.with_live(|entries| {
            let before = entries.len();
            entries.retain(|key, _| !glob_match(pattern, key));
            (before - entries.len()) as u64
        }))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        token: &str,
        hold: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.with_live(|entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.to_owned(), (token.to_owned(), Instant::now() + hold));
                true
            }
        }))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<(), StoreError> {
        self.with_live(|entries| {
            if entries.get(key).is_some_and(|(held, _)| held == token) {
                entries.remove(key);
            }
        });
        Ok(())
    }

    async fn stats(&self, pattern: &str) -> Result<StoreStats, StoreError> {
        Ok(self.with_live(|entries| StoreStats {
            keys: entries.keys().filter(|key| glob_match(pattern, key)).count() as u64,
        }))
    }
}
