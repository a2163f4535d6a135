use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Arguments of one producer call, keyed by parameter name.
///
/// A `BTreeMap` keeps the canonical (sorted) ordering by construction, so two
/// call sites passing the same arguments in different order always serialize
/// identically.
pub type ProducerArgs = BTreeMap<String, serde_json::Value>;

/// A fully qualified store key for one cached indicator result.
///
/// The key is `{prefix}:{schema}:{name}:{hash}` where `hash` covers the
/// canonical JSON serialization of the call arguments. The schema tag is
/// bumped whenever the [`CacheRecord`](super::CacheRecord) encoding changes,
/// which makes every record written by an older build unreachable without an
/// explicit migration.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    name: Arc<str>,
    full: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl CacheKey {
    /// The logical name this key was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full store key.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The key of the refresh lease guarding this entry.
    pub fn lease_key(&self) -> String {
        format!("refresh:{}", self.full)
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        let full: Arc<str> = key.into().into();
        CacheKey {
            name: full.clone(),
            full,
        }
    }
}

/// Derives [`CacheKey`]s from logical names and call arguments.
///
/// Pure and deterministic: equal `(name, args)` always yield the same key,
/// and keys built under different schema versions never collide.
#[derive(Clone, Debug)]
pub struct KeyBuilder {
    prefix: Arc<str>,
}

impl KeyBuilder {
    /// Bump whenever the record encoding changes.
    pub const SCHEMA_VERSION: &'static str = "v1";

    pub fn new(prefix: &str) -> Self {
        KeyBuilder {
            prefix: prefix.into(),
        }
    }

    /// Builds the key for `name` called with `args`.
    pub fn build(&self, name: &str, args: &ProducerArgs) -> CacheKey {
        let full = format!(
            "{}:{}:{}:{}",
            self.prefix,
            Self::SCHEMA_VERSION,
            name,
            args_hash(args)
        );
        CacheKey {
            name: name.into(),
            full: full.into(),
        }
    }

    /// Expands a logical-name glob into a full store-key pattern,
    /// scoped to the current schema version.
    pub fn pattern(&self, name_glob: &str) -> String {
        format!(
            "{}:{}:{}:*",
            self.prefix,
            Self::SCHEMA_VERSION,
            name_glob
        )
    }
}

/// Hashes the canonical argument serialization, truncated to 12 hex chars.
fn args_hash(args: &ProducerArgs) -> String {
    // `serde_json` maps are sorted by key, so nested objects are canonical too.
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let hash = Sha256::digest(canonical.as_bytes());
    hash[..6].iter().map(|b| format!("{b:02x}")).collect()
}
