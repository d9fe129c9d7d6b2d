//! Market phase from exchange-local time.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::calendar::ExchangeCalendar;

/// Trading phase of the exchange day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPhase {
    Premarket,
    Open,
    Post,
    Closed,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Premarket => "PREMARKET",
            Self::Open => "OPEN",
            Self::Post => "POST",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PREMARKET" => Ok(Self::Premarket),
            "OPEN" => Ok(Self::Open),
            "POST" => Ok(Self::Post),
            "CLOSED" => Ok(Self::Closed),
            other => Err(format!("unknown market phase {other:?}")),
        }
    }
}

/// Phase at `now_local`. Non-trading days are always `Closed`.
pub fn market_phase(now_local: NaiveDateTime, calendar: &dyn ExchangeCalendar) -> MarketPhase {
    let Some(schedule) = calendar.schedule(now_local.date()) else {
        return MarketPhase::Closed;
    };

    if now_local < schedule.pre_open {
        MarketPhase::Closed
    } else if now_local < schedule.market_open {
        MarketPhase::Premarket
    } else if now_local < schedule.market_close {
        MarketPhase::Open
    } else if now_local < schedule.post_close {
        MarketPhase::Post
    } else {
        MarketPhase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::calendar::NyseCalendar;
    use chrono::NaiveDate;
    use test_case::test_case;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test_case(3, 59, MarketPhase::Closed)]
    #[test_case(4, 0, MarketPhase::Premarket)]
    #[test_case(9, 29, MarketPhase::Premarket)]
    #[test_case(9, 30, MarketPhase::Open)]
    #[test_case(15, 59, MarketPhase::Open)]
    #[test_case(16, 0, MarketPhase::Post)]
    #[test_case(19, 59, MarketPhase::Post)]
    #[test_case(20, 0, MarketPhase::Closed)]
    fn test_phase_boundaries(h: u32, m: u32, expected: MarketPhase) {
        let cal = NyseCalendar::new();
        assert_eq!(market_phase(at(2026, 10, 19, h, m), &cal), expected);
    }

    #[test]
    fn test_weekend_and_holiday_closed() {
        let cal = NyseCalendar::new();
        assert_eq!(market_phase(at(2026, 10, 17, 10, 0), &cal), MarketPhase::Closed);
        assert_eq!(market_phase(at(2026, 11, 26, 10, 0), &cal), MarketPhase::Closed);
    }

    #[test]
    fn test_early_close_shifts_post() {
        let cal = NyseCalendar::new();
        assert_eq!(market_phase(at(2026, 11, 27, 13, 30), &cal), MarketPhase::Post);
        assert_eq!(market_phase(at(2026, 11, 27, 17, 30), &cal), MarketPhase::Closed);
    }

    #[test]
    fn test_same_input_same_phase() {
        let cal = NyseCalendar::new();
        let now = at(2026, 10, 19, 8, 15);
        let first = market_phase(now, &cal);
        for _ in 0..5 {
            assert_eq!(market_phase(now, &cal), first);
        }
    }

    #[test]
    fn test_phase_round_trip_names() {
        assert_eq!("premarket".parse::<MarketPhase>().unwrap(), MarketPhase::Premarket);
        assert_eq!(MarketPhase::Closed.to_string(), "CLOSED");
        assert!("lunch".parse::<MarketPhase>().is_err());
    }
}
