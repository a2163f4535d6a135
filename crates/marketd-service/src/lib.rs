//! The core service library for `marketd`.
//!
//! It keeps derived market indicators available with bounded staleness: a
//! cache-aside layer that prefers serving an old payload over none at all
//! (see [`caching`]), and a time-aware scheduler that refreshes indicators
//! on a per-market cadence before consumers have to wait for them (see
//! [`scheduling`]).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod producer;
pub mod scheduling;
pub mod service;
pub mod utils;
