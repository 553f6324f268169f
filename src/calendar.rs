//! Fetch end-date boundary
//!
//! Decides the last session whose bar is complete, so the fetch stage never
//! stores a partial current-day bar.

use crate::error::{Result, StocknubError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How far an update fetch should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Up to today's session, once the exchange has closed
    Today,
    /// Up to the previous session, regardless of the time of day
    Yesterday,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Today => f.write_str("today"),
            UpdateMode::Yesterday => f.write_str("yesterday"),
        }
    }
}

impl FromStr for UpdateMode {
    type Err = StocknubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "today" => Ok(UpdateMode::Today),
            "yesterday" => Ok(UpdateMode::Yesterday),
            other => Err(StocknubError::ConfigError(format!(
                "update mode must be 'today' or 'yesterday', got '{}'",
                other
            ))),
        }
    }
}

/// Exchange-local clock used to resolve the fetch end date
#[derive(Debug, Clone, Copy)]
pub struct ExchangeClock {
    timezone: Tz,
    market_close: NaiveTime,
}

impl ExchangeClock {
    pub fn new(timezone: Tz, market_close: NaiveTime) -> Self {
        Self {
            timezone,
            market_close,
        }
    }

    /// Parse an IANA timezone name
    pub fn from_name(timezone: &str, market_close: NaiveTime) -> Result<Self> {
        let tz: Tz = timezone.parse().map_err(|_| {
            StocknubError::ConfigError(format!("unknown exchange timezone '{}'", timezone))
        })?;
        Ok(Self::new(tz, market_close))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Last date whose session is complete at instant `now`
    pub fn end_date(&self, mode: UpdateMode, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();
        match mode {
            UpdateMode::Yesterday => previous_weekday(today),
            UpdateMode::Today => {
                if !is_weekend(today) && local.time() >= self.market_close {
                    today
                } else {
                    previous_weekday(today)
                }
            }
        }
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Closest weekday strictly before `date`
pub fn previous_weekday(date: NaiveDate) -> NaiveDate {
    let mut current = date - Duration::days(1);
    while is_weekend(current) {
        current = current - Duration::days(1);
    }
    current
}
