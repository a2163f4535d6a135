//! The stale-tolerant cache in front of indicator producers.
//!
//! Every payload lives in a shared store under a deterministic, versioned
//! key (see [`KeyBuilder`]). A record has two lifetimes: the logical TTL,
//! after which it is *stale*, and the physical TTL (`ttl +
//! stale_tolerance`), after which the store evicts it. In between, readers
//! keep getting the stale payload while a single refresh replaces it, so
//! consumers see old data before they see no data.
//!
//! Refreshes are deduplicated at two levels. Within a process, an in-flight
//! set keeps at most one refresh task per key. Across processes, a
//! store-backed [`Lease`] (`SET NX PX` plus compare-and-delete release)
//! keeps at most one producer run per key. Both levels fail open: when the
//! store is unreachable, reads fall through to direct uncached producer
//! calls and leases trivially succeed, trading duplicate work for
//! availability.
//!
//! The entry point is [`Cacher::resolve`], which never waits for a
//! producer; the scheduler-facing warm paths ([`Cacher::refresh_now`],
//! [`Cacher::warm`]) do.

mod cache_key;
mod entry;
mod lock;
mod resolver;
mod store;


pub use cache_key::{CacheKey, KeyBuilder, ProducerArgs};
pub use entry::{CacheRecord, Freshness, RecordMeta, physical_ttl};
pub use lock::{Lease, WaitMode};
pub use resolver::{Cacher, CacherOptions, Resolution};
pub use store::{MemoryStore, RedisStore, Store, StoreError, StoreStats};
