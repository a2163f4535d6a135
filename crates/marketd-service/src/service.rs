//! Wiring of the cache, producers and scheduler into one service handle.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{Cacher, KeyBuilder, RedisStore, Resolution, Store, StoreStats};
use crate::config::Config;
use crate::producer::{CachedIndicator, HttpJsonProducer, Producer};
use crate::scheduling::{Market, RunningWarmer, WarmJob, Warmer};
use crate::utils::http::browser_client;

struct RegisteredJob {
    id: String,
    market: Market,
    indicator: CachedIndicator,
    producer: Arc<dyn Producer>,
}

/// The assembled service: a [`Cacher`] over the configured store plus the
/// set of registered warm jobs.
///
/// All collaborators are owned here and handed down explicitly; the only
/// process-wide state in the crate is the metrics client.
pub struct Service {
    config: Config,
    store: Arc<dyn Store>,
    cacher: Cacher,
    jobs: Vec<RegisteredJob>,
}

impl Service {
    /// Creates the service against the configured Redis store.
    ///
    /// The store connection is established lazily, so this succeeds while
    /// Redis is down; resolution degrades until it comes back.
    pub fn create(config: Config) -> Result<Self> {
        let store = RedisStore::new(&config.redis.url)
            .context("failed to configure the redis store")?;
        Self::with_store(config, Arc::new(store))
    }

    /// Creates the service over an explicit store implementation.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let keys = KeyBuilder::new(&config.cache.prefix);
        let cacher = Cacher::new(store.clone(), keys, config.cache.cacher_options());

        let mut service = Service {
            store,
            cacher,
            jobs: Vec::new(),
            config,
        };
        service.register_configured_jobs()?;
        Ok(service)
    }

    fn register_configured_jobs(&mut self) -> Result<()> {
        if self.config.jobs.is_empty() {
            return Ok(());
        }
        let client = browser_client(self.config.upstream.timeouts())
            .context("failed to build the upstream http client")?;
        for job in &self.config.jobs {
            let indicator = job.indicator(&self.config.cache);
            let producer = Arc::new(HttpJsonProducer::new(client.clone(), job.url.clone()));
            self.jobs.push(RegisteredJob {
                id: job.id.clone(),
                market: job.market,
                indicator,
                producer,
            });
        }
        Ok(())
    }

    /// Registers a job with a custom producer, for embedding the service
    /// in another binary.
    pub fn register_job(
        &mut self,
        id: impl Into<String>,
        market: Market,
        indicator: CachedIndicator,
        producer: Arc<dyn Producer>,
    ) {
        self.jobs.push(RegisteredJob {
            id: id.into(),
            market,
            indicator,
            producer,
        });
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cacher(&self) -> &Cacher {
        &self.cacher
    }

    /// Resolves a registered job through the cache, never waiting for the
    /// producer.
    pub async fn resolve_job(&self, id: &str) -> Result<Resolution> {
        let job = self.job(id)?;
        Ok(self.cacher.resolve(&job.indicator, job.producer.clone()).await)
    }

    /// Refreshes a registered job right now, waiting for the producer.
    pub async fn warm_job(&self, id: &str) -> Result<Resolution> {
        let job = self.job(id)?;
        Ok(self.cacher.warm(&job.indicator, job.producer.clone()).await)
    }

    fn job(&self, id: &str) -> Result<&RegisteredJob> {
        self.jobs
            .iter()
            .find(|job| job.id == id)
            .with_context(|| format!("no job registered as {id}"))
    }

    /// Warms every registered job once, sequentially.
    pub async fn warm_all(&self) {
        self.warmer().initial_warm().await;
    }

    /// Starts the periodic schedule. The caller owns the returned handle
    /// and is responsible for shutting it down.
    pub fn start_scheduler(&self) -> RunningWarmer {
        self.warmer().start()
    }

    fn warmer(&self) -> Warmer {
        let scheduler = &self.config.scheduler;
        let mut warmer = Warmer::new(
            self.cacher.clone(),
            Arc::new(scheduler.sessions.clone()),
            scheduler.intervals.clone(),
            scheduler.warmer_options(),
        );
        for job in &self.jobs {
            warmer.register(WarmJob {
                id: job.id.clone(),
                spec: job.indicator.clone(),
                market: job.market,
                producer: job.producer.clone(),
            });
        }
        warmer
    }

    /// Drops every record whose logical name matches `name_glob`.
    pub async fn flush(&self, name_glob: &str) -> Result<u64> {
        let pattern = self.cacher.keys().pattern(name_glob);
        let deleted = self
            .store
            .delete_pattern(&pattern)
            .await
            .context("failed to flush cache records")?;
        tracing::info!(%pattern, deleted, "flushed cache records");
        Ok(deleted)
    }

    /// Key count under this service's namespace.
    pub async fn stats(&self) -> Result<StoreStats> {
        let pattern = self.cacher.keys().pattern("*");
        self.store
            .stats(&pattern)
            .await
            .context("failed to collect store stats")
    }
}
