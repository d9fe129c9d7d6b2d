//! NYSE trading calendar in exchange-local time.
//!
//! Holidays follow the exchange's published rules: fixed-date holidays
//! falling on Saturday are observed the Friday before (except New Year's
//! Day, which is then skipped), Sunday holidays the Monday after. Early
//! closes (13:00) apply on July 3, the day after Thanksgiving, and
//! Christmas Eve when those are regular weekdays.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Exchange time zone.
pub const EXCHANGE_TZ: Tz = chrono_tz::America::New_York;

/// Convert a UTC instant into exchange wall-clock time.
pub fn to_exchange_local(ts: DateTime<Utc>) -> NaiveDateTime {
    ts.with_timezone(&EXCHANGE_TZ).naive_local()
}

/// Convert exchange wall-clock time into UTC. Times inside a DST gap map
/// to the instant just after the gap.
pub fn exchange_to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    match EXCHANGE_TZ.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => exchange_to_utc(local + Duration::hours(1)),
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

// ============================================================================
// Session Hours
// ============================================================================

/// Wall-clock session boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHours {
    pub pre_open: NaiveTime,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub post_close: NaiveTime,
    pub early_close: NaiveTime,
    pub early_post_close: NaiveTime,
}

impl Default for SessionHours {
    fn default() -> Self {
        Self {
            pre_open: hm(4, 0),
            market_open: hm(9, 30),
            market_close: hm(16, 0),
            post_close: hm(20, 0),
            early_close: hm(13, 0),
            early_post_close: hm(17, 0),
        }
    }
}

/// Boundary times for one trading day, exchange-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSchedule {
    pub date: NaiveDate,
    pub pre_open: NaiveDateTime,
    pub market_open: NaiveDateTime,
    pub market_close: NaiveDateTime,
    pub post_close: NaiveDateTime,
    pub early_close: bool,
}

// ============================================================================
// Calendar Trait
// ============================================================================

/// Source of trading days and session boundaries.
pub trait ExchangeCalendar: Send + Sync {
    /// Schedule for `date`, `None` on weekends and holidays.
    fn schedule(&self, date: NaiveDate) -> Option<SessionSchedule>;

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.schedule(date).is_some()
    }

    /// Most recent trading day strictly before `date`.
    fn previous_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut day = date.pred_opt()?;
        for _ in 0..31 {
            if self.is_trading_day(day) {
                return Some(day);
            }
            day = day.pred_opt()?;
        }
        None
    }

    /// The `n` trading days strictly before `date`, oldest first.
    fn previous_trading_days(&self, date: NaiveDate, n: usize) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(n);
        let mut cursor = date;
        while days.len() < n {
            match self.previous_trading_day(cursor) {
                Some(day) => {
                    days.push(day);
                    cursor = day;
                }
                None => break,
            }
        }
        days.reverse();
        days
    }
}

// ============================================================================
// NYSE Calendar
// ============================================================================

/// Rule-based NYSE calendar with optional operator-supplied closures.
#[derive(Debug, Clone, Default)]
pub struct NyseCalendar {
    hours: SessionHours,
    extra_holidays: BTreeSet<NaiveDate>,
}

impl NyseCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add unscheduled closures (e.g., national days of mourning).
    pub fn with_extra_holidays(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.extra_holidays.extend(dates);
        self
    }

    pub fn hours(&self) -> &SessionHours {
        &self.hours
    }

    /// Name of the holiday on `date`, if the exchange is closed for one.
    pub fn holiday_name(&self, date: NaiveDate) -> Option<&'static str> {
        if self.extra_holidays.contains(&date) {
            return Some("Special Closure");
        }
        let year = date.year();

        if observed_new_year(date) {
            return Some("New Year's Day");
        }
        let checks: [(Option<NaiveDate>, &'static str); 9] = [
            (nth_weekday(year, 1, Weekday::Mon, 3), "Martin Luther King Jr. Day"),
            (nth_weekday(year, 2, Weekday::Mon, 3), "Washington's Birthday"),
            (easter_sunday(year).and_then(|d| d.checked_sub_signed(Duration::days(2))), "Good Friday"),
            (last_weekday(year, 5, Weekday::Mon), "Memorial Day"),
            (
                if year >= 2022 { observed(NaiveDate::from_ymd_opt(year, 6, 19)) } else { None },
                "Juneteenth",
            ),
            (observed(NaiveDate::from_ymd_opt(year, 7, 4)), "Independence Day"),
            (nth_weekday(year, 9, Weekday::Mon, 1), "Labor Day"),
            (nth_weekday(year, 11, Weekday::Thu, 4), "Thanksgiving Day"),
            (observed(NaiveDate::from_ymd_opt(year, 12, 25)), "Christmas Day"),
        ];
        checks
            .into_iter()
            .find(|(day, _)| *day == Some(date))
            .map(|(_, name)| name)
    }

    /// Regular 13:00 close days.
    pub fn is_early_close(&self, date: NaiveDate) -> bool {
        if is_weekend(date) || self.holiday_name(date).is_some() {
            return false;
        }
        let weekday = date.weekday();
        let mon_to_thu = !matches!(weekday, Weekday::Fri | Weekday::Sat | Weekday::Sun);
        match (date.month(), date.day()) {
            (7, 3) => mon_to_thu,
            (12, 24) => mon_to_thu,
            _ => nth_weekday(date.year(), 11, Weekday::Thu, 4)
                .and_then(|t| t.succ_opt())
                .is_some_and(|friday| friday == date),
        }
    }
}

impl ExchangeCalendar for NyseCalendar {
    fn schedule(&self, date: NaiveDate) -> Option<SessionSchedule> {
        if is_weekend(date) || self.holiday_name(date).is_some() {
            return None;
        }
        let early = self.is_early_close(date);
        let (close, post) = if early {
            (self.hours.early_close, self.hours.early_post_close)
        } else {
            (self.hours.market_close, self.hours.post_close)
        };
        Some(SessionSchedule {
            date,
            pre_open: date.and_time(self.hours.pre_open),
            market_open: date.and_time(self.hours.market_open),
            market_close: date.and_time(close),
            post_close: date.and_time(post),
            early_close: early,
        })
    }
}

// ============================================================================
// Date Rules
// ============================================================================

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Saturday → Friday before, Sunday → Monday after.
fn observed(date: Option<NaiveDate>) -> Option<NaiveDate> {
    let date = date?;
    match date.weekday() {
        Weekday::Sat => date.pred_opt(),
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    }
}

/// Jan 1, or Jan 2 when Jan 1 is a Sunday. A Saturday Jan 1 is not observed.
fn observed_new_year(date: NaiveDate) -> bool {
    match (date.month(), date.day()) {
        (1, 1) => !is_weekend(date),
        (1, 2) => date.weekday() == Weekday::Mon,
        _ => false,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_next.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Gregorian Easter (anonymous algorithm).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

// ============================================================================
// Tests
// ============================================================================
