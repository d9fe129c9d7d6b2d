//! Watchlist Common - configuration, errors and logging shared by the
//! watchlist crates.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{expand_path, parse_flag, ConfigSource};
pub use error::{Error, Result, ResultExt};
pub use logging::{init_logging, LoggingConfig};
