use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::producer::{CachedIndicator, Producer, ProducerError, ResultPolicy};
use crate::utils::defer::defer;

use super::cache_key::{CacheKey, KeyBuilder};
use super::entry::{CacheRecord, Freshness, physical_ttl};
use super::lock::{Lease, WaitMode};
use super::store::Store;

/// The outcome of resolving one indicator through the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// A logically valid payload.
    Fresh {
        payload: serde_json::Value,
        remaining: Duration,
    },
    /// A payload past its logical expiry, served while a refresh happens
    /// elsewhere. `fallback` marks payloads kept alive by a failed refresh.
    Stale {
        payload: serde_json::Value,
        refreshing: bool,
        fallback: bool,
    },
    /// Nothing cached yet; a refresh has been triggered.
    WarmingUp,
    /// The producer failed and there was no prior payload to fall back to.
    ProducerError(String),
}

/// Tuning knobs shared by all resolutions.
#[derive(Clone, Debug)]
pub struct CacherOptions {
    /// How long a refresh lease is held before it self-expires.
    pub lock_hold: Duration,
    /// How long a blocking warm waits for a contended lease.
    pub lock_wait: Duration,
    /// Default error-shape policy, overridable per indicator.
    pub policy: ResultPolicy,
}

impl Default for CacherOptions {
    fn default() -> Self {
        CacherOptions {
            lock_hold: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            policy: ResultPolicy::default(),
        }
    }
}

/// The cache-aside layer in front of producers.
///
/// Serving never blocks on production: a fresh record is returned as-is, a
/// stale record is returned while a refresh runs in the background, and a
/// miss answers [`Resolution::WarmingUp`] with a refresh on the way. Only
/// the warm paths ([`refresh_now`](Self::refresh_now) and
/// [`warm`](Self::warm)) wait for the producer.
///
/// Refresh deduplication is two-level: a process-local in-flight set keeps
/// one task per key in this process, and the store-backed [`Lease`] keeps
/// one producer per key fleet-wide.
#[derive(Clone)]
pub struct Cacher {
    store: Arc<dyn Store>,
    keys: KeyBuilder,
    options: Arc<CacherOptions>,
    refreshes: Arc<Mutex<HashSet<CacheKey>>>,
}

impl Cacher {
    pub fn new(store: Arc<dyn Store>, keys: KeyBuilder, options: CacherOptions) -> Self {
        Cacher {
            store,
            keys,
            options: Arc::new(options),
            refreshes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    #[cfg(test)]
    pub(crate) fn store_for_testing(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolves `spec`, waiting for the producer only in direct mode (store
    /// unreachable).
    pub async fn resolve(&self, spec: &CachedIndicator, producer: Arc<dyn Producer>) -> Resolution {
        let key = self.keys.build(&spec.name, &spec.args);
        metric!(counter("cache.access") += 1, "indicator" => &spec.name);

        let raw = match self.store.get(key.as_str()).await {
            Ok(raw) => raw,
            Err(error) => {
                // Direct mode: produce for this caller alone, uncached and
                // unlocked, until the store comes back.
                tracing::warn!(%key, %error, "store unreachable, serving direct");
                metric!(counter("store.read_error") += 1);
                return self.produce_direct(spec, producer).await;
            }
        };

        // Records are classified on read as well as on write: a policy or
        // config change can turn an already cached payload error-shaped,
        // and such a payload must never be served as data.
        let policy = spec.policy.as_ref().unwrap_or(&self.options.policy);
        match raw.as_deref().and_then(CacheRecord::decode) {
            Some(record) => match record.freshness(Utc::now()) {
                Freshness::Fresh { remaining } => {
                    if let Some(message) = policy.error_message(&record.data) {
                        metric!(counter("cache.hit.error") += 1, "indicator" => &spec.name);
                        return Resolution::ProducerError(message);
                    }
                    metric!(counter("cache.hit.fresh") += 1, "indicator" => &spec.name);
                    Resolution::Fresh {
                        payload: record.data,
                        remaining,
                    }
                }
                Freshness::Stale { .. } => {
                    metric!(counter("cache.hit.stale") += 1, "indicator" => &spec.name);
                    let refreshing = self.spawn_refresh(spec, producer, key);
                    if let Some(message) = policy.error_message(&record.data) {
                        metric!(counter("cache.hit.error") += 1, "indicator" => &spec.name);
                        return Resolution::ProducerError(message);
                    }
                    Resolution::Stale {
                        payload: record.data,
                        refreshing,
                        fallback: record.meta.fallback,
                    }
                }
            },
            None => {
                metric!(counter("cache.miss") += 1, "indicator" => &spec.name);
                self.spawn_refresh(spec, producer, key);
                Resolution::WarmingUp
            }
        }
    }

    /// Refreshes `spec` right now, waiting for the producer.
    ///
    /// Used by the scheduler's periodic jobs. Waits on a contended lease up
    /// to the configured budget and then serves whatever the other holder
    /// produced.
    pub async fn refresh_now(
        &self,
        spec: &CachedIndicator,
        producer: Arc<dyn Producer>,
    ) -> Resolution {
        let key = self.keys.build(&spec.name, &spec.args);
        let inserted = self.in_flight().insert(key.clone());
        let guard = inserted.then(|| {
            let refreshes = self.refreshes.clone();
            let key = key.clone();
            defer(move || {
                lock_set(&refreshes).remove(&key);
            })
        });

        let wait = WaitMode::Blocking(self.options.lock_wait);
        let resolution = self.run_refresh(&key, spec, producer, wait, true).await;
        drop(guard);
        resolution
    }

    /// Like [`refresh_now`](Self::refresh_now), but skips production while a
    /// fresh record already exists. Used by the startup warm so restarts do
    /// not hammer upstreams.
    pub async fn warm(&self, spec: &CachedIndicator, producer: Arc<dyn Producer>) -> Resolution {
        let key = self.keys.build(&spec.name, &spec.args);
        if let Some(record) = self.read(&key).await
            && let Freshness::Fresh { remaining } = record.freshness(Utc::now())
        {
            return Resolution::Fresh {
                payload: record.data,
                remaining,
            };
        }
        self.refresh_now(spec, producer).await
    }

    /// Runs the producer for one caller without touching the store.
    async fn produce_direct(
        &self,
        spec: &CachedIndicator,
        producer: Arc<dyn Producer>,
    ) -> Resolution {
        let policy = spec.policy.as_ref().unwrap_or(&self.options.policy);
        match producer.produce(&spec.args).await {
            Ok(payload) => match policy.error_message(&payload) {
                Some(message) => Resolution::ProducerError(message),
                None => Resolution::Fresh {
                    payload,
                    remaining: spec.ttl,
                },
            },
            Err(error) => Resolution::ProducerError(error.to_string()),
        }
    }

    /// Reads and decodes the record for `key`.
    ///
    /// Store failures and undecodable records both degrade to a miss.
    async fn read(&self, key: &CacheKey) -> Option<CacheRecord> {
        match self.store.get(key.as_str()).await {
            Ok(raw) => raw.as_deref().and_then(CacheRecord::decode),
            Err(error) => {
                tracing::warn!(%key, %error, "store read failed, treating as miss");
                metric!(counter("store.read_error") += 1);
                None
            }
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<CacheKey>> {
        lock_set(&self.refreshes)
    }

    /// Starts a background refresh for `key` unless one is already running
    /// in this process. Returns whether a local refresh is now in flight.
    fn spawn_refresh(
        &self,
        spec: &CachedIndicator,
        producer: Arc<dyn Producer>,
        key: CacheKey,
    ) -> bool {
        if !self.in_flight().insert(key.clone()) {
            return true;
        }

        let this = self.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let refreshes = this.refreshes.clone();
            let done_key = key.clone();
            // Removal happens strictly after the lease release inside
            // `run_refresh`, and on panic as well.
            let _done = defer(move || {
                lock_set(&refreshes).remove(&done_key);
            });

            let outcome = this
                .run_refresh(&key, &spec, producer, WaitMode::NonBlocking, false)
                .await;
            if let Resolution::ProducerError(error) = outcome {
                tracing::warn!(%key, %error, "background refresh failed");
            }
        });
        true
    }

    /// Acquires the lease, runs the producer, writes the result.
    ///
    /// The only place producer results enter the store. On producer failure
    /// with a prior record, the prior payload is kept alive with a full
    /// physical TTL so a key that once succeeded never goes fully empty.
    ///
    /// Without `force`, a record that turned fresh between the trigger and
    /// the lease acquisition short-circuits the producer; scheduled
    /// refreshes pass `force` to re-produce on their own cadence, and only
    /// skip when the acquisition had to wait on another producer.
    async fn run_refresh(
        &self,
        key: &CacheKey,
        spec: &CachedIndicator,
        producer: Arc<dyn Producer>,
        wait: WaitMode,
        force: bool,
    ) -> Resolution {
        let lease = Lease::try_acquire(self.store.clone(), key, self.options.lock_hold, wait).await;
        let Some(lease) = lease else {
            // Another holder kept the lease; serve what they left behind.
            return match self.read(key).await {
                Some(record) => match record.freshness(Utc::now()) {
                    Freshness::Fresh { remaining } => Resolution::Fresh {
                        payload: record.data,
                        remaining,
                    },
                    Freshness::Stale { .. } => Resolution::Stale {
                        payload: record.data,
                        refreshing: true,
                        fallback: record.meta.fallback,
                    },
                },
                None => Resolution::WarmingUp,
            };
        };

        if lease.waited() || !force {
            // Whoever we raced against probably filled the cache already.
            if let Some(record) = self.read(key).await
                && let Freshness::Fresh { remaining } = record.freshness(Utc::now())
            {
                lease.release().await;
                return Resolution::Fresh {
                    payload: record.data,
                    remaining,
                };
            }
        }

        let policy = spec.policy.as_ref().unwrap_or(&self.options.policy);
        let started = Instant::now();
        let produced = match producer.produce(&spec.args).await {
            Ok(payload) => match policy.error_message(&payload) {
                Some(message) => Err(ProducerError::ErrorPayload(message)),
                None => Ok(payload),
            },
            Err(error) => Err(error),
        };

        let store_ttl = physical_ttl(spec.ttl, spec.stale_tolerance);
        let resolution = match produced {
            Ok(payload) => {
                metric!(timer("refresh.duration") = started.elapsed(), "indicator" => &spec.name);
                metric!(counter("refresh.ok") += 1, "indicator" => &spec.name);
                let record = CacheRecord::new(payload.clone(), spec.ttl, Utc::now());
                self.write(key, &record, store_ttl).await;
                Resolution::Fresh {
                    payload,
                    remaining: spec.ttl,
                }
            }
            Err(error) => {
                metric!(counter("refresh.error") += 1, "indicator" => &spec.name);
                match self.read(key).await {
                    Some(prior) => {
                        tracing::warn!(
                            %key,
                            %error,
                            "producer failed, extending stale payload"
                        );
                        metric!(counter("refresh.fallback") += 1, "indicator" => &spec.name);
                        let fallback = if prior.meta.fallback {
                            // Already marked by an earlier failure; only the
                            // physical TTL needs a new lease on life.
                            if let Err(error) =
                                self.store.expire(key.as_str(), store_ttl).await
                            {
                                tracing::warn!(%key, %error, "failed to extend cache record");
                                metric!(counter("store.write_error") += 1);
                            }
                            prior
                        } else {
                            let fallback = prior.into_fallback();
                            self.write(key, &fallback, store_ttl).await;
                            fallback
                        };
                        Resolution::Stale {
                            payload: fallback.data,
                            refreshing: false,
                            fallback: true,
                        }
                    }
                    None => Resolution::ProducerError(error.to_string()),
                }
            }
        };

        lease.release().await;
        resolution
    }

    async fn write(&self, key: &CacheKey, record: &CacheRecord, store_ttl: Duration) {
        if let Err(error) = self.store.set(key.as_str(), &record.encode(), store_ttl).await {
            tracing::warn!(%key, %error, "failed to write cache record");
            metric!(counter("store.write_error") += 1);
        }
    }
}

fn lock_set<'a>(
    refreshes: &'a Mutex<HashSet<CacheKey>>,
) -> MutexGuard<'a, HashSet<CacheKey>> {
    refreshes
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
