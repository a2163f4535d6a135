use std::sync::Arc;
use std::time::Duration;

use super::CacheKey;
use super::store::Store;

/// How long an acquisition attempt may block.
#[derive(Clone, Copy, Debug)]
pub enum WaitMode {
    /// Return immediately when the lease is held elsewhere.
    NonBlocking,
    /// Poll for up to the given duration before giving up.
    Blocking(Duration),
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fleet-wide refresh lease for one cache key.
///
/// Backed by `SET NX PX` in the store, so at most one process holds the
/// lease at a time and a crashed holder frees it when the hold time
/// elapses. When the store is unreachable the lease trivially succeeds:
/// a broken store must degrade coordination, never availability. Such a
/// fail-open lease carries no token and its release is a no-op.
///
/// Release is explicit and must happen on every exit path of the holder.
pub struct Lease {
    store: Arc<dyn Store>,
    key: String,
    token: Option<String>,
    waited: bool,
}

impl Lease {
    /// Tries to take the refresh lease for `key`.
    ///
    /// Returns `None` when another holder kept the lease for the whole
    /// wait budget.
    pub async fn try_acquire(
        store: Arc<dyn Store>,
        key: &CacheKey,
        hold: Duration,
        wait: WaitMode,
    ) -> Option<Lease> {
        let lease_key = key.lease_key();
        let token = uuid::Uuid::new_v4().to_string();

        let deadline = match wait {
            WaitMode::NonBlocking => None,
            WaitMode::Blocking(max_wait) => Some(tokio::time::Instant::now() + max_wait),
        };

        let mut waited = false;
        loop {
            match store.acquire_lock(&lease_key, &token, hold).await {
                Ok(true) => {
                    return Some(Lease {
                        store,
                        key: lease_key,
                        token: Some(token),
                        waited,
                    });
                }
                Ok(false) => {
                    metric!(counter("lock.contended") += 1, "key" => key.name());
                    match deadline {
                        Some(deadline) if tokio::time::Instant::now() + POLL_INTERVAL <= deadline => {
                            waited = true;
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                        _ => return None,
                    }
                }
                Err(error) => {
                    // Store down: proceed uncoordinated rather than stall.
                    tracing::warn!(key = %key, %error, "lock store unavailable, failing open");
                    metric!(counter("lock.failopen") += 1);
                    return Some(Lease {
                        store,
                        key: lease_key,
                        token: None,
                        waited,
                    });
                }
            }
        }
    }

    /// Whether acquisition had to wait for another holder. After a wait the
    /// caller should re-check the store before producing.
    pub fn waited(&self) -> bool {
        self.waited
    }

    pub async fn release(self) {
        let Some(token) = self.token else {
            return;
        };
        if let Err(error) = self.store.release_lock(&self.key, &token).await {
            // The hold timeout will free it.
            tracing::warn!(key = %self.key, %error, "failed to release refresh lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::MemoryStore;
    use super::*;

    fn key() -> CacheKey {
        CacheKey::for_testing("marketd:v1:bonds:abc")
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hold = Duration::from_secs(30);

        let first = Lease::try_acquire(store.clone(), &key(), hold, WaitMode::NonBlocking)
            .await
            .unwrap();
        assert!(!first.waited());

        assert!(
            Lease::try_acquire(store.clone(), &key(), hold, WaitMode::NonBlocking)
                .await
                .is_none()
        );

        first.release().await;
        assert!(
            Lease::try_acquire(store, &key(), hold, WaitMode::NonBlocking)
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_blocking_wait_records_the_wait() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hold = Duration::from_secs(30);

        let first = Lease::try_acquire(store.clone(), &key(), hold, WaitMode::NonBlocking)
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let store = store.clone();
            async move {
                Lease::try_acquire(store, &key(), hold, WaitMode::Blocking(Duration::from_secs(5)))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        first.release().await;

        let second = waiter.await.unwrap().unwrap();
        assert!(second.waited());
        second.release().await;
    }

    #[tokio::test]
    async fn test_blocking_wait_gives_up() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hold = Duration::from_secs(30);

        let _first = Lease::try_acquire(store.clone(), &key(), hold, WaitMode::NonBlocking)
            .await
            .unwrap();
        let second = Lease::try_acquire(
            store,
            &key(),
            hold,
            WaitMode::Blocking(Duration::from_millis(300)),
        )
        .await;
        assert!(second.is_none());
    }
}
