//! Background warming of registered indicators.
//!
//! The [`Warmer`] keeps every registered indicator inside its freshness
//! window so consumers rarely see a cold or stale cache. How often a job
//! runs depends on its market: a [`TradingCalendar`] decides whether the
//! market is in session, and the per-market [`MarketIntervals`] pick the
//! cadence accordingly.

mod calendar;
mod scheduler;

pub use calendar::{
    Market, MarketSessions, SessionTableCalendar, SessionWindow, TradingCalendar,
};
pub use scheduler::{MarketIntervals, RunningWarmer, WarmJob, Warmer, WarmerOptions};
