use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::caching::{Cacher, Resolution};
use crate::producer::{CachedIndicator, Producer};

use super::calendar::{Market, TradingCalendar};

/// Refresh cadence of one market, split by session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MarketIntervals {
    #[serde(with = "humantime_serde")]
    pub trading: Duration,
    #[serde(with = "humantime_serde")]
    pub non_trading: Duration,
}

impl Default for MarketIntervals {
    fn default() -> Self {
        MarketIntervals {
            trading: Duration::from_secs(1800),
            non_trading: Duration::from_secs(7200),
        }
    }
}

impl MarketIntervals {
    fn shortest(&self) -> Duration {
        self.trading.min(self.non_trading)
    }
}

#[derive(Clone, Debug)]
pub struct WarmerOptions {
    /// Upper bound of the random delay before each scheduled refresh, so
    /// jobs registered together do not hit upstreams together.
    pub jitter: Duration,
    /// Attempts per job during the startup warm.
    pub initial_attempts: u32,
    /// Backoff after the first failed startup attempt; doubles per retry.
    pub initial_backoff: Duration,
}

impl Default for WarmerOptions {
    fn default() -> Self {
        WarmerOptions {
            jitter: Duration::from_secs(10),
            initial_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

/// One periodic warm registration.
pub struct WarmJob {
    pub id: String,
    pub spec: CachedIndicator,
    pub market: Market,
    pub producer: Arc<dyn Producer>,
}

/// Keeps registered indicators warm on a market-aware cadence.
///
/// Each job runs on its own task, ticking at the shorter of its market's
/// two intervals and deciding in the body, against the calendar, whether
/// enough time has passed for the cadence in effect. A job awaits its own
/// refresh, so it never overlaps itself, and missed ticks are skipped
/// rather than bursted. Job failures are logged and never unwind the
/// scheduler.
pub struct Warmer {
    cacher: Cacher,
    calendar: Arc<dyn TradingCalendar>,
    intervals: BTreeMap<Market, MarketIntervals>,
    options: WarmerOptions,
    jobs: Vec<Arc<WarmJob>>,
}

impl Warmer {
    pub fn new(
        cacher: Cacher,
        calendar: Arc<dyn TradingCalendar>,
        intervals: BTreeMap<Market, MarketIntervals>,
        options: WarmerOptions,
    ) -> Self {
        Warmer {
            cacher,
            calendar,
            intervals,
            options,
            jobs: Vec::new(),
        }
    }

    pub fn register(&mut self, job: WarmJob) {
        self.jobs.push(Arc::new(job));
    }

    fn intervals_for(&self, market: Market) -> MarketIntervals {
        self.intervals.get(&market).copied().unwrap_or_default()
    }

    /// Warms every job once, sequentially, before the periodic schedule
    /// starts. A job that keeps failing is logged and skipped; the rest of
    /// the startup is never blocked on one broken upstream.
    pub async fn initial_warm(&self) {
        for job in &self.jobs {
            let mut backoff = self.options.initial_backoff;
            for attempt in 1..=self.options.initial_attempts.max(1) {
                match self.cacher.warm(&job.spec, job.producer.clone()).await {
                    Resolution::ProducerError(error) => {
                        tracing::warn!(job = %job.id, attempt, %error, "initial warm failed");
                        metric!(counter("warm.initial.error") += 1, "job" => &job.id);
                        if attempt < self.options.initial_attempts {
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                        }
                    }
                    _ => {
                        metric!(counter("warm.initial.ok") += 1, "job" => &job.id);
                        break;
                    }
                }
            }
        }
    }

    /// Starts one task per job and hands back the running schedule.
    pub fn start(self) -> RunningWarmer {
        tracing::info!(jobs = self.jobs.len(), "starting warm schedule");
        let cancel = CancellationToken::new();
        let handles = self
            .jobs
            .iter()
            .map(|job| {
                let job_loop = JobLoop {
                    cacher: self.cacher.clone(),
                    calendar: self.calendar.clone(),
                    intervals: self.intervals_for(job.market),
                    jitter: self.options.jitter,
                    job: job.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(job_loop.run())
            })
            .collect();
        RunningWarmer { cancel, handles }
    }
}

struct JobLoop {
    cacher: Cacher,
    calendar: Arc<dyn TradingCalendar>,
    intervals: MarketIntervals,
    jitter: Duration,
    job: Arc<WarmJob>,
    cancel: CancellationToken,
}

impl JobLoop {
    async fn run(self) {
        let tick = self.intervals.shortest().max(Duration::from_secs(1));
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(job = %self.job.id, ?tick, "warm job started");
        let mut last_run: Option<tokio::time::Instant> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let trading = self
                .calendar
                .is_trading_session(self.job.market, Utc::now());
            let cadence = if trading {
                self.intervals.trading
            } else {
                self.intervals.non_trading
            };
            // Half a tick of slack so cadence-sized gaps are not skipped
            // over timer drift.
            let due = last_run
                .is_none_or(|at| at.elapsed() >= cadence.saturating_sub(tick / 2));
            if !due {
                continue;
            }

            if !self.jitter.is_zero() {
                let delay = rand::thread_rng().gen_range(Duration::ZERO..=self.jitter);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            last_run = Some(tokio::time::Instant::now());
            metric!(counter("warm.run") += 1, "job" => &self.job.id, "trading" => if trading { "true" } else { "false" });
            match self
                .cacher
                .refresh_now(&self.job.spec, self.job.producer.clone())
                .await
            {
                Resolution::ProducerError(error) => {
                    tracing::warn!(job = %self.job.id, %error, "scheduled refresh failed");
                    metric!(counter("warm.error") += 1, "job" => &self.job.id);
                }
                Resolution::Stale { fallback: true, .. } => {
                    tracing::warn!(job = %self.job.id, "scheduled refresh fell back to stale");
                }
                _ => {}
            }
        }
        tracing::debug!(job = %self.job.id, "warm job stopped");
    }
}

/// Handle to a started schedule; owns the job tasks.
pub struct RunningWarmer {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunningWarmer {
    /// Stops all jobs, waiting up to `grace` for in-flight refreshes.
    /// Jobs still running after the grace period are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::caching::{CacherOptions, KeyBuilder, MemoryStore, ProducerArgs};
    use crate::producer::ProducerError;

    use super::*;

    struct FixedCalendar(bool);

    impl TradingCalendar for FixedCalendar {
        fn is_trading_session(&self, _market: Market, _at: chrono::DateTime<Utc>) -> bool {
            self.0
        }
    }

    struct CountingProducer {
        calls: AtomicUsize,
        failures: usize,
    }

    impl CountingProducer {
        fn new() -> Arc<Self> {
            Arc::new(CountingProducer {
                calls: AtomicUsize::new(0),
                failures: 0,
            })
        }

        fn failing_first(failures: usize) -> Arc<Self> {
            Arc::new(CountingProducer {
                calls: AtomicUsize::new(0),
                failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Producer for CountingProducer {
        async fn produce(&self, _args: &ProducerArgs) -> Result<serde_json::Value, ProducerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProducerError::Other("warming failure".into()))
            } else {
                Ok(json!({"data": call}))
            }
        }
    }

    fn warmer(calendar: FixedCalendar, trading: u64, non_trading: u64) -> Warmer {
        let cacher = Cacher::new(
            Arc::new(MemoryStore::new()),
            KeyBuilder::new("test"),
            CacherOptions::default(),
        );
        let intervals = BTreeMap::from([(
            Market::Metals,
            MarketIntervals {
                trading: Duration::from_secs(trading),
                non_trading: Duration::from_secs(non_trading),
            },
        )]);
        let options = WarmerOptions {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        Warmer::new(cacher, Arc::new(calendar), intervals, options)
    }

    fn job(producer: Arc<dyn Producer>) -> WarmJob {
        WarmJob {
            id: "metals".into(),
            // Zero TTL keeps every record stale so each run hits the producer.
            spec: CachedIndicator::new("metals", Duration::ZERO, Duration::from_secs(600)),
            market: Market::Metals,
            producer,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_trading_cadence() {
        let mut warmer = warmer(FixedCalendar(true), 60, 180);
        let producer = CountingProducer::new();
        warmer.register(job(producer.clone()));

        let running = warmer.start();
        tokio::time::sleep(Duration::from_secs(610)).await;
        running.shutdown(Duration::from_secs(5)).await;

        // One run per 60s tick over ~10 minutes.
        let calls = producer.calls();
        assert!((9..=11).contains(&calls), "got {calls} runs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slows_down_outside_trading_sessions() {
        let mut warmer = warmer(FixedCalendar(false), 60, 180);
        let producer = CountingProducer::new();
        warmer.register(job(producer.clone()));

        let running = warmer.start();
        tokio::time::sleep(Duration::from_secs(610)).await;
        running.shutdown(Duration::from_secs(5)).await;

        // Ticks every 60s but the 180s cadence gates most of them.
        let calls = producer.calls();
        assert!((3..=5).contains(&calls), "got {calls} runs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_warm_retries_with_backoff() {
        let mut warmer = warmer(FixedCalendar(true), 60, 180);
        let producer = CountingProducer::failing_first(2);
        warmer.register(job(producer.clone()));

        warmer.initial_warm().await;
        assert_eq!(producer.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_warm_gives_up_and_moves_on() {
        let mut warmer = warmer(FixedCalendar(true), 60, 180);
        let broken = CountingProducer::failing_first(usize::MAX);
        let healthy = CountingProducer::new();
        warmer.register(WarmJob {
            id: "broken".into(),
            spec: CachedIndicator::new("broken", Duration::from_secs(60), Duration::from_secs(600)),
            market: Market::Metals,
            producer: broken.clone(),
        });
        warmer.register(job(healthy.clone()));

        warmer.initial_warm().await;
        assert_eq!(broken.calls(), 3);
        assert_eq!(healthy.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_jobs() {
        let mut warmer = warmer(FixedCalendar(true), 60, 180);
        let producer = CountingProducer::new();
        warmer.register(job(producer.clone()));

        let running = warmer.start();
        tokio::time::sleep(Duration::from_secs(61)).await;
        running.shutdown(Duration::from_secs(5)).await;
        let settled = producer.calls();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(producer.calls(), settled);
    }
}
