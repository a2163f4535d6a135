use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata stored alongside every cached payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecordMeta {
    /// When the payload was produced.
    pub cached_at: DateTime<Utc>,
    /// Logical expiry. After this instant the record is stale but still
    /// servable until the physical store TTL evicts it.
    pub expire_at: DateTime<Utc>,
    /// The logical TTL the record was written with.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Set when a failed refresh re-served this payload instead of
    /// replacing it.
    #[serde(default)]
    pub fallback: bool,
}

/// One cached producer result as it lives in the store.
///
/// Serialized as `{"_meta": {...}, "data": ...}`. The record carries its own
/// logical expiry; the store only sees the physical TTL
/// (`ttl + stale_tolerance`), so a record remains readable for the whole
/// stale window and then disappears on its own.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheRecord {
    #[serde(rename = "_meta")]
    pub meta: RecordMeta,
    pub data: serde_json::Value,
}

/// Where a record stands relative to its logical expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Logically valid for `remaining` more time.
    Fresh { remaining: Duration },
    /// Past logical expiry by `behind`, still servable.
    Stale { behind: Duration },
}

impl CacheRecord {
    pub fn new(data: serde_json::Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        let expire_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        CacheRecord {
            meta: RecordMeta {
                cached_at: now,
                expire_at,
                ttl,
                fallback: false,
            },
            data,
        }
    }

    /// Decodes a stored record.
    ///
    /// Anything that does not parse as the current encoding (older schema
    /// leftovers, truncated writes) is treated as absent rather than an
    /// error, so a shape change degrades to a MISS.
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn encode(&self) -> String {
        // The record is plain data; this serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn freshness(&self, at: DateTime<Utc>) -> Freshness {
        if at < self.meta.expire_at {
            let remaining = (self.meta.expire_at - at).to_std().unwrap_or_default();
            Freshness::Fresh { remaining }
        } else {
            let behind = (at - self.meta.expire_at).to_std().unwrap_or_default();
            Freshness::Stale { behind }
        }
    }

    /// Marks the record as a re-served fallback after a failed refresh.
    pub fn into_fallback(mut self) -> Self {
        self.meta.fallback = true;
        self
    }
}

/// Physical store TTL: how long a record stays readable, including the
/// stale window.
pub fn physical_ttl(ttl: Duration, stale_tolerance: Duration) -> Duration {
    ttl + stale_tolerance
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_roundtrip_keeps_wire_shape() {
        let now = Utc::now();
        let record = CacheRecord::new(json!({"sectors": [1, 2]}), Duration::from_secs(60), now);
        let raw = record.encode();

        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("_meta").is_some());
        assert_eq!(value["data"]["sectors"], json!([1, 2]));

        let decoded = CacheRecord::decode(&raw).unwrap();
        assert_eq!(decoded.meta.ttl, Duration::from_secs(60));
        assert!(!decoded.meta.fallback);
    }

    #[test]
    fn test_unexpected_shape_is_a_miss() {
        assert!(CacheRecord::decode("{\"value\": 3}").is_none());
        assert!(CacheRecord::decode("not json").is_none());
        assert!(CacheRecord::decode("").is_none());
    }

    #[test]
    fn test_freshness_transitions() {
        let now = Utc::now();
        let record = CacheRecord::new(json!(1), Duration::from_secs(60), now);

        match record.freshness(now + chrono::Duration::seconds(30)) {
            Freshness::Fresh { remaining } => assert_eq!(remaining, Duration::from_secs(30)),
            other => panic!("expected fresh, got {other:?}"),
        }
        match record.freshness(now + chrono::Duration::seconds(90)) {
            Freshness::Stale { behind } => assert_eq!(behind, Duration::from_secs(30)),
            other => panic!("expected stale, got {other:?}"),
        }
        // Expiry itself is already stale.
        assert!(matches!(
            record.freshness(record.meta.expire_at),
            Freshness::Stale { .. }
        ));
    }

    #[test]
    fn test_physical_ttl_covers_stale_window() {
        assert_eq!(
            physical_ttl(Duration::from_secs(60), Duration::from_secs(120)),
            Duration::from_secs(180)
        );
    }
}
