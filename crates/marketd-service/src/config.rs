use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{CacherOptions, ProducerArgs};
use crate::producer::{CachedIndicator, ResultPolicy};
use crate::scheduling::{Market, MarketIntervals, SessionTableCalendar, WarmerOptions};
use crate::utils::http::UpstreamTimeouts;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level filter.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(de::Error::custom)
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "marketd".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls the cache layer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Key prefix under which all records live.
    pub prefix: String,
    /// Logical TTL for jobs that do not set their own.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Stale window as a multiple of the logical TTL, for jobs that do not
    /// set an explicit stale tolerance.
    pub stale_ratio: u32,
    /// How long a refresh lease is held before it self-expires.
    #[serde(with = "humantime_serde")]
    pub lock_hold: Duration,
    /// How long a blocking warm waits for a contended lease.
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    /// Default error-shape detection for producer payloads.
    pub result_policy: ResultPolicy,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            prefix: "marketd".into(),
            default_ttl: Duration::from_secs(1800),
            stale_ratio: 2,
            lock_hold: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            result_policy: ResultPolicy::default(),
        }
    }
}

impl CacheSettings {
    pub fn cacher_options(&self) -> CacherOptions {
        CacherOptions {
            lock_hold: self.lock_hold,
            lock_wait: self.lock_wait,
            policy: self.result_policy.clone(),
        }
    }
}

/// Controls the warm scheduler.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Upper bound of the random pre-run delay.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Attempts per job during the startup warm.
    pub initial_attempts: u32,
    /// Backoff after a failed startup attempt; doubles per retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// How long shutdown waits for in-flight refreshes.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Per-market refresh cadence.
    pub intervals: BTreeMap<Market, MarketIntervals>,
    /// Per-market session tables.
    pub sessions: SessionTableCalendar,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let half_hour = Duration::from_secs(1800);
        let hour = Duration::from_secs(3600);
        let two_hours = Duration::from_secs(7200);
        let intervals = BTreeMap::from([
            (
                Market::DomesticEquities,
                MarketIntervals {
                    trading: half_hour,
                    non_trading: two_hours,
                },
            ),
            (
                Market::UsEquities,
                MarketIntervals {
                    trading: hour,
                    non_trading: two_hours,
                },
            ),
            (
                Market::Metals,
                MarketIntervals {
                    trading: hour,
                    non_trading: two_hours,
                },
            ),
        ]);
        SchedulerSettings {
            jitter: Duration::from_secs(10),
            initial_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(30),
            intervals,
            sessions: SessionTableCalendar::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn warmer_options(&self) -> WarmerOptions {
        WarmerOptions {
            jitter: self.jitter,
            initial_attempts: self.initial_attempts,
            initial_backoff: self.initial_backoff,
        }
    }
}

/// Timeouts for upstream producer requests.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct Upstream {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for Upstream {
    fn default() -> Self {
        let timeouts = UpstreamTimeouts::default();
        Upstream {
            connect_timeout: timeouts.connect,
            request_timeout: timeouts.request,
        }
    }
}

impl Upstream {
    pub fn timeouts(&self) -> UpstreamTimeouts {
        UpstreamTimeouts {
            connect: self.connect_timeout,
            request: self.request_timeout,
        }
    }
}

/// One warm job definition.
#[derive(Clone, Debug, Deserialize)]
pub struct JobConfig {
    /// Unique job id, used in logs and metrics.
    pub id: String,
    /// Logical indicator name the cache key is derived from.
    pub indicator: String,
    /// Upstream URL the payload is fetched from.
    pub url: url::Url,
    /// The market deciding cadence and sessions.
    #[serde(default = "default_market")]
    pub market: Market,
    /// Arguments passed to the producer and hashed into the key.
    #[serde(default)]
    pub args: ProducerArgs,
    /// Logical TTL; defaults to the cache-wide `default_ttl`.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Stale window; defaults to `ttl * stale_ratio`.
    #[serde(default, with = "humantime_serde")]
    pub stale_tolerance: Option<Duration>,
    /// Overrides the cache-wide result policy.
    #[serde(default)]
    pub result_policy: Option<ResultPolicy>,
}

fn default_market() -> Market {
    Market::Unclassified
}

impl JobConfig {
    /// Resolves this job against the cache-wide defaults.
    pub fn indicator(&self, cache: &CacheSettings) -> CachedIndicator {
        let ttl = self.ttl.unwrap_or(cache.default_ttl);
        let stale_tolerance = self
            .stale_tolerance
            .unwrap_or(ttl * cache.stale_ratio.max(1));
        let mut indicator =
            CachedIndicator::new(&self.indicator, ttl, stale_tolerance).with_args(self.args.clone());
        if let Some(policy) = &self.result_policy {
            indicator = indicator.with_policy(policy.clone());
        }
        indicator
    }
}

/// Controls the store connection.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The sentry DSN to report errors to.
    pub sentry_dsn: Option<Dsn>,
    /// The environment reported to sentry and metrics.
    pub environment: Option<String>,
    pub redis: RedisSettings,
    pub logging: Logging,
    pub metrics: Metrics,
    pub cache: CacheSettings,
    pub scheduler: SchedulerSettings,
    pub upstream: Upstream,
    /// The indicators kept warm by the scheduler.
    pub jobs: Vec<JobConfig>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_errors() {
        assert!(Config::from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.prefix, "marketd");
        assert_eq!(config.cache.stale_ratio, 2);
        assert_eq!(config.logging.level, LevelFilter::INFO);
        assert!(config.jobs.is_empty());
        assert!(
            config
                .scheduler
                .intervals
                .contains_key(&Market::DomesticEquities)
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let yaml = r#"
            redis:
              url: redis://cache.internal:6379/2
            logging:
              level: debug
              format: json
            cache:
              default_ttl: 10m
              stale_ratio: 3
            scheduler:
              jitter: 5s
              intervals:
                metals:
                  trading: 1h
                  non_trading: 4h
            jobs:
              - id: fear-greed
                indicator: fear_greed
                url: https://upstream.example/api/fear-greed
                market: domestic-equities
                args:
                  days: 14
                ttl: 15m
        "#;
        let config = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(config.redis.url, "redis://cache.internal:6379/2");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(600));
        assert_eq!(
            config.scheduler.intervals[&Market::Metals].non_trading,
            Duration::from_secs(4 * 3600)
        );

        let job = &config.jobs[0];
        assert_eq!(job.market, Market::DomesticEquities);
        let indicator = job.indicator(&config.cache);
        assert_eq!(indicator.ttl, Duration::from_secs(900));
        // Unset stale tolerance falls back to ttl * stale_ratio.
        assert_eq!(indicator.stale_tolerance, Duration::from_secs(2700));
        assert_eq!(indicator.args["days"], serde_json::json!(14));
    }

    #[test]
    fn test_job_policy_override() {
        let yaml = r#"
            jobs:
              - id: bonds
                indicator: bonds
                url: https://upstream.example/api/bonds
                result_policy:
                  error_field: err
                  payload_fields: [rows]
        "#;
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        let indicator = config.jobs[0].indicator(&config.cache);
        let policy = indicator.policy.unwrap();
        assert_eq!(policy.error_field, "err");
        assert_eq!(policy.payload_fields, vec!["rows".to_string()]);
    }
}
