use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// The market a warm job is bound to, deciding which refresh cadence and
/// session table apply.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Market {
    DomesticEquities,
    UsEquities,
    Metals,
    Unclassified,
}

impl Market {
    pub fn name(&self) -> &'static str {
        match self {
            Market::DomesticEquities => "domestic-equities",
            Market::UsEquities => "us-equities",
            Market::Metals => "metals",
            Market::Unclassified => "unclassified",
        }
    }
}

/// One continuous trading window in the table's local clock.
/// `close < open` means the window crosses midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

/// Per-market session table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketSessions {
    pub windows: Vec<SessionWindow>,
    pub weekdays_only: bool,
    /// Trades around the clock; windows are ignored.
    pub always_open: bool,
    /// Offset of the local clock the windows are expressed in.
    pub utc_offset_hours: i32,
}

impl Default for MarketSessions {
    fn default() -> Self {
        MarketSessions {
            windows: Vec::new(),
            weekdays_only: true,
            always_open: false,
            utc_offset_hours: 8,
        }
    }
}

/// Decides whether a market is in a trading session at a given instant.
pub trait TradingCalendar: Send + Sync + 'static {
    fn is_trading_session(&self, market: Market, at: DateTime<Utc>) -> bool;
}

/// [`TradingCalendar`] driven by static per-market session tables.
///
/// Holidays are not modeled; a session table is a cadence hint, not an
/// exchange calendar. A market without a table falls back to "weekday
/// daytime means trading": mistaking a holiday for a session only costs a
/// few extra refreshes, while the opposite mistake serves stale data all
/// day.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SessionTableCalendar {
    pub sessions: BTreeMap<Market, MarketSessions>,
}

fn window(open: (u32, u32), close: (u32, u32)) -> SessionWindow {
    // Static table entries; the literals are always valid times.
    SessionWindow {
        open: NaiveTime::from_hms_opt(open.0, open.1, 0).unwrap_or_default(),
        close: NaiveTime::from_hms_opt(close.0, close.1, 0).unwrap_or_default(),
    }
}

impl Default for SessionTableCalendar {
    /// A-share morning/afternoon sessions, the US session as seen from
    /// UTC+8 (crossing midnight), and round-the-clock metals.
    fn default() -> Self {
        let mut sessions = BTreeMap::new();
        sessions.insert(
            Market::DomesticEquities,
            MarketSessions {
                windows: vec![window((9, 30), (11, 30)), window((13, 0), (15, 0))],
                ..Default::default()
            },
        );
        sessions.insert(
            Market::UsEquities,
            MarketSessions {
                windows: vec![window((21, 30), (4, 0))],
                ..Default::default()
            },
        );
        sessions.insert(
            Market::Metals,
            MarketSessions {
                always_open: true,
                weekdays_only: false,
                ..Default::default()
            },
        );
        SessionTableCalendar { sessions }
    }
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

impl SessionTableCalendar {
    fn local(at: DateTime<Utc>, utc_offset_hours: i32) -> DateTime<FixedOffset> {
        match FixedOffset::east_opt(utc_offset_hours.saturating_mul(3600)) {
            Some(offset) => at.with_timezone(&offset),
            // Nonsensical offsets in config degrade to UTC.
            None => at.fixed_offset(),
        }
    }

    /// The fallback when no table entry exists: trading on weekday daytime
    /// (08:00-20:00 local), non-trading on weekends and at night.
    fn fallback(at: DateTime<Utc>, utc_offset_hours: i32) -> bool {
        let local = Self::local(at, utc_offset_hours);
        !is_weekend(local.weekday()) && (8..20).contains(&local.hour())
    }
}

impl TradingCalendar for SessionTableCalendar {
    fn is_trading_session(&self, market: Market, at: DateTime<Utc>) -> bool {
        let Some(sessions) = self.sessions.get(&market) else {
            return Self::fallback(at, MarketSessions::default().utc_offset_hours);
        };
        if sessions.always_open {
            return true;
        }

        let local = Self::local(at, sessions.utc_offset_hours);
        if sessions.weekdays_only && is_weekend(local.weekday()) {
            return false;
        }

        let time = local.time();
        sessions.windows.iter().any(|w| {
            if w.open <= w.close {
                w.open <= time && time < w.close
            } else {
                time >= w.open || time < w.close
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_market_serde_names() {
        assert_eq!(
            serde_json::to_string(&Market::DomesticEquities).unwrap(),
            "\"domestic-equities\""
        );
        let market: Market = serde_json::from_str("\"us-equities\"").unwrap();
        assert_eq!(market, Market::UsEquities);
    }

    #[test]
    fn test_domestic_sessions() {
        let calendar = SessionTableCalendar::default();
        // Tue 2026-08-25, 10:00 UTC+8.
        assert!(calendar.is_trading_session(Market::DomesticEquities, at(2026, 8, 25, 2, 0)));
        // Lunch break, 12:00 UTC+8.
        assert!(!calendar.is_trading_session(Market::DomesticEquities, at(2026, 8, 25, 4, 0)));
        // Afternoon session, 14:00 UTC+8.
        assert!(calendar.is_trading_session(Market::DomesticEquities, at(2026, 8, 25, 6, 0)));
        // Saturday.
        assert!(!calendar.is_trading_session(Market::DomesticEquities, at(2026, 8, 29, 2, 0)));
    }

    #[test]
    fn test_us_session_crosses_midnight() {
        let calendar = SessionTableCalendar::default();
        // Tue 22:00 UTC+8 is 14:00 UTC.
        assert!(calendar.is_trading_session(Market::UsEquities, at(2026, 8, 25, 14, 0)));
        // Wed 03:00 UTC+8 is Tue 19:00 UTC.
        assert!(calendar.is_trading_session(Market::UsEquities, at(2026, 8, 25, 19, 0)));
        // Wed 12:00 UTC+8 is outside the session.
        assert!(!calendar.is_trading_session(Market::UsEquities, at(2026, 8, 26, 4, 0)));
    }

    #[test]
    fn test_metals_always_open() {
        let calendar = SessionTableCalendar::default();
        // Sunday night included.
        assert!(calendar.is_trading_session(Market::Metals, at(2026, 8, 30, 18, 0)));
    }

    #[test]
    fn test_unknown_market_fallback() {
        let calendar = SessionTableCalendar {
            sessions: BTreeMap::new(),
        };
        // Weekday daytime leans toward trading.
        assert!(calendar.is_trading_session(Market::Unclassified, at(2026, 8, 25, 2, 0)));
        // Weekend leans toward non-trading.
        assert!(!calendar.is_trading_session(Market::Unclassified, at(2026, 8, 29, 2, 0)));
        // Weekday deep night too.
        assert!(!calendar.is_trading_session(Market::Unclassified, at(2026, 8, 25, 18, 0)));
    }
}
