//! Producers compute the payloads the cache serves.
//!
//! A producer is anything that can turn a set of call arguments into a JSON
//! payload. The cache layer never looks inside payloads except through a
//! [`ResultPolicy`], which decides whether a successfully returned payload is
//! actually an upstream error in disguise.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caching::ProducerArgs;

/// A failure to produce a payload.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned an error payload: {0}")]
    ErrorPayload(String),
    #[error("{0}")]
    Other(String),
}

/// Computes the payload for one indicator.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    async fn produce(&self, args: &ProducerArgs) -> Result<serde_json::Value, ProducerError>;
}

/// Decides whether a payload that was returned successfully is error-shaped.
///
/// Upstream data sources tend to answer HTTP 200 with `{"error": ...}`
/// bodies. A payload is treated as an error iff it carries the error field
/// AND none of the payload-bearing fields is present and non-empty; a
/// partial result that has real data next to an error note is still worth
/// caching.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResultPolicy {
    pub error_field: String,
    pub payload_fields: Vec<String>,
}

impl Default for ResultPolicy {
    fn default() -> Self {
        ResultPolicy {
            error_field: "error".into(),
            payload_fields: ["sectors", "stocks", "data", "indices", "items"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ResultPolicy {
    /// Returns the upstream error message if `payload` is error-shaped.
    pub fn error_message(&self, payload: &serde_json::Value) -> Option<String> {
        let error = payload.get(&self.error_field)?;
        let has_data = self.payload_fields.iter().any(|field| {
            payload
                .get(field)
                .is_some_and(|value| !value_is_empty(value))
        });
        if has_data {
            return None;
        }
        Some(match error {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

fn value_is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// The full registration of one cached indicator: its identity (name + args)
/// and the caching parameters applied to it.
#[derive(Clone, Debug)]
pub struct CachedIndicator {
    pub name: String,
    pub args: ProducerArgs,
    /// Logical TTL; after this the record is stale.
    pub ttl: Duration,
    /// How long past logical expiry a record stays servable.
    pub stale_tolerance: Duration,
    /// Overrides the cacher-wide result policy when set.
    pub policy: Option<ResultPolicy>,
}

impl CachedIndicator {
    pub fn new(name: impl Into<String>, ttl: Duration, stale_tolerance: Duration) -> Self {
        CachedIndicator {
            name: name.into(),
            args: ProducerArgs::new(),
            ttl,
            stale_tolerance,
            policy: None,
        }
    }

    pub fn with_args(mut self, args: ProducerArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_policy(mut self, policy: ResultPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// A [`Producer`] fetching a JSON payload from a fixed URL, passing the call
/// arguments as query parameters.
pub struct HttpJsonProducer {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpJsonProducer {
    pub fn new(client: reqwest::Client, url: url::Url) -> Self {
        HttpJsonProducer { client, url }
    }
}

#[async_trait]
impl Producer for HttpJsonProducer {
    async fn produce(&self, args: &ProducerArgs) -> Result<serde_json::Value, ProducerError> {
        let query: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();

        let response = self
            .client
            .get(self.url.clone())
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_error_shaped_payloads() {
        let policy = ResultPolicy::default();

        assert_eq!(
            policy.error_message(&json!({"error": "rate limited"})),
            Some("rate limited".into())
        );
        // Non-string error values still yield a message.
        assert_eq!(
            policy.error_message(&json!({"error": {"code": 5}})),
            Some(r#"{"code":5}"#.into())
        );
        // Empty payload fields do not rescue an error.
        assert!(
            policy
                .error_message(&json!({"error": "e", "sectors": []}))
                .is_some()
        );
    }

    #[test]
    fn test_partial_results_are_not_errors() {
        let policy = ResultPolicy::default();

        assert_eq!(
            policy.error_message(&json!({"error": "partial", "sectors": [1]})),
            None
        );
        assert_eq!(policy.error_message(&json!({"sectors": []})), None);
        assert_eq!(policy.error_message(&json!([1, 2, 3])), None);
    }

    #[test]
    fn test_policy_override_fields() {
        let policy = ResultPolicy {
            error_field: "err".into(),
            payload_fields: vec!["rows".into()],
        };
        assert!(policy.error_message(&json!({"err": "x"})).is_some());
        assert!(
            policy
                .error_message(&json!({"err": "x", "rows": [1]}))
                .is_none()
        );
        // The default error field is not special under an override.
        assert!(policy.error_message(&json!({"error": "x"})).is_none());
    }
}
