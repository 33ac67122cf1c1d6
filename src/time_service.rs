//! `TimeService` collaborator (spec §6.1).
//!
//! Calendar and trading-session queries are never implemented ad hoc by
//! the engine; every component asks this trait. `ExchangeCalendar` is a
//! concrete, minimal implementation (weekday trading days plus an
//! explicit holiday list) good enough to drive the test suite and a
//! small live deployment; a production caller is expected to inject a
//! richer implementation (actual exchange holiday calendars, early
//! closes) without the engine itself changing.

use crate::clock::Nanos;
use chrono::{Datelike, NaiveDate, TimeZone, Weekday};
use chrono_tz::Tz;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradingSession {
    pub regular_open: Nanos,
    pub regular_close: Nanos,
    pub is_holiday: bool,
    pub is_early_close: bool,
}

/// Calendar, trading-session and clock-reading contract. Implementors must
/// never be asked to construct a zoned datetime on the engine's behalf —
/// they own that responsibility entirely.
pub trait TimeService: Send + Sync {
    fn get_current_time(&self) -> Nanos;
    fn set_virtual_time(&self, t: Nanos);
    fn get_trading_session(&self, date: NaiveDate) -> Option<TradingSession>;
    fn is_trading_day(&self, date: NaiveDate) -> bool;
    fn count_trading_days(&self, a: NaiveDate, b: NaiveDate) -> i64;
    fn get_next_trading_date(&self, date: NaiveDate) -> NaiveDate;
    fn get_market_hours(&self, date: NaiveDate) -> Option<(Nanos, Nanos)>;
    fn get_exchange_timezone(&self) -> Tz;
    /// Exchange-local calendar date for a given instant — the single place
    /// day-grouping happens; everything else treats `Nanos` opaquely.
    fn local_date(&self, t: Nanos) -> NaiveDate {
        let utc = crate::clock::nanos_to_datetime(t);
        utc.with_timezone(&self.get_exchange_timezone()).date_naive()
    }
}

/// A minimal weekday + explicit-holiday-list calendar.
pub struct ExchangeCalendar {
    timezone: Tz,
    holidays: BTreeSet<NaiveDate>,
    early_closes: BTreeSet<NaiveDate>,
    regular_open: (u32, u32),
    regular_close: (u32, u32),
    early_close: (u32, u32),
    virtual_time: parking_lot::RwLock<Nanos>,
    mode: crate::clock::ClockMode,
}

impl ExchangeCalendar {
    pub fn new(timezone: Tz, mode: crate::clock::ClockMode) -> Self {
        Self {
            timezone,
            holidays: BTreeSet::new(),
            early_closes: BTreeSet::new(),
            regular_open: (9, 30),
            regular_close: (16, 0),
            early_close: (13, 0),
            virtual_time: parking_lot::RwLock::new(0),
            mode,
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn with_early_closes(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.early_closes.extend(dates);
        self
    }

    fn local_datetime_to_nanos(&self, date: NaiveDate, hour: u32, minute: u32) -> Nanos {
        let naive = date.and_hms_opt(hour, minute, 0).expect("valid time");
        let zoned = self
            .timezone
            .from_local_datetime(&naive)
            .single()
            .unwrap_or_else(|| self.timezone.from_utc_datetime(&naive));
        crate::clock::datetime_to_nanos(&zoned.with_timezone(&chrono::Utc))
    }
}

impl TimeService for ExchangeCalendar {
    fn get_current_time(&self) -> Nanos {
        match self.mode {
            crate::clock::ClockMode::Backtest => *self.virtual_time.read(),
            crate::clock::ClockMode::Live => {
                crate::clock::datetime_to_nanos(&chrono::Utc::now())
            }
        }
    }

    fn set_virtual_time(&self, t: Nanos) {
        *self.virtual_time.write() = t;
    }

    fn get_trading_session(&self, date: NaiveDate) -> Option<TradingSession> {
        let is_holiday = self.holidays.contains(&date);
        let is_weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        if is_weekend {
            return None;
        }
        let is_early_close = self.early_closes.contains(&date);
        let close = if is_early_close { self.early_close } else { self.regular_close };
        Some(TradingSession {
            regular_open: self.local_datetime_to_nanos(date, self.regular_open.0, self.regular_open.1),
            regular_close: self.local_datetime_to_nanos(date, close.0, close.1),
            is_holiday,
            is_early_close,
        })
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn count_trading_days(&self, a: NaiveDate, b: NaiveDate) -> i64 {
        if a > b {
            return -self.count_trading_days(b, a);
        }
        let mut count = 0i64;
        let mut d = a;
        while d <= b {
            if self.is_trading_day(d) {
                count += 1;
            }
            d = d.succ_opt().expect("date overflow");
        }
        count
    }

    fn get_next_trading_date(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.succ_opt().expect("date overflow");
        while !self.is_trading_day(d) {
            d = d.succ_opt().expect("date overflow");
        }
        d
    }

    fn get_market_hours(&self, date: NaiveDate) -> Option<(Nanos, Nanos)> {
        self.get_trading_session(date).map(|s| (s.regular_open, s.regular_close))
    }

    fn get_exchange_timezone(&self) -> Tz {
        self.timezone
    }
}
