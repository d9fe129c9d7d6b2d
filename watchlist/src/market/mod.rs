//! Exchange calendar and market phase.

pub mod calendar;
pub mod phase;

pub use calendar::{
    exchange_to_utc, to_exchange_local, ExchangeCalendar, NyseCalendar, SessionHours,
    SessionSchedule, EXCHANGE_TZ,
};
pub use phase::{market_phase, MarketPhase};
