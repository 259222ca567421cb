//! Timestamps and read staleness bounds

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A point in time as reported by the database (commit and read timestamps).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// The timestamp moved back by `staleness`, saturating instead of
    /// overflowing for absurd durations.
    pub fn saturating_sub(&self, staleness: Duration) -> Self {
        match chrono::Duration::from_std(staleness) {
            Ok(delta) => Self(self.0 - delta),
            Err(_) => Self(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| Error::invalid_argument(format!("invalid timestamp '{}': {}", s, e)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// Time units accepted for statement timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(value),
            TimeUnit::Microseconds => Duration::from_micros(value),
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
        }
    }

    pub fn abbreviation(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "ns",
            TimeUnit::Microseconds => "us",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
        }
    }
}

/// How stale a read snapshot is allowed to be.
///
/// `MaxStaleness` and `MinReadTimestamp` are bounded-staleness modes that let
/// the server pick the freshest timestamp within the bound; they are only
/// valid for single-use reads in autocommit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimestampBound {
    #[default]
    Strong,
    ExactStaleness(Duration),
    ReadTimestamp(Timestamp),
    MaxStaleness(Duration),
    MinReadTimestamp(Timestamp),
}

impl TimestampBound {
    /// True for the two bounded-staleness modes that are restricted to
    /// autocommit single-use reads.
    pub fn is_only_valid_for_single_use(&self) -> bool {
        matches!(
            self,
            TimestampBound::MaxStaleness(_) | TimestampBound::MinReadTimestamp(_)
        )
    }
}

impl fmt::Display for TimestampBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampBound::Strong => f.write_str("STRONG"),
            TimestampBound::ExactStaleness(d) => {
                write!(f, "EXACT_STALENESS {}", format_duration(*d))
            }
            TimestampBound::ReadTimestamp(ts) => write!(f, "READ_TIMESTAMP {}", ts),
            TimestampBound::MaxStaleness(d) => write!(f, "MAX_STALENESS {}", format_duration(*d)),
            TimestampBound::MinReadTimestamp(ts) => write!(f, "MIN_READ_TIMESTAMP {}", ts),
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else if d.subsec_nanos() % 1_000 == 0 {
        format!("{}us", d.as_micros())
    } else {
        format!("{}ns", d.as_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = Timestamp::now();
        let parsed = Timestamp::parse(&ts.to_string()).unwrap();
        assert_eq!(ts.to_string(), parsed.to_string());
    }

    #[test]
    fn test_timestamp_ordering() {
        let earlier = Timestamp::now();
        let later = Timestamp::from_datetime(earlier.as_datetime() + chrono::Duration::seconds(1));
        assert!(earlier < later);
    }

    #[test]
    fn test_bound_display() {
        assert_eq!(TimestampBound::Strong.to_string(), "STRONG");
        assert_eq!(
            TimestampBound::ExactStaleness(Duration::from_secs(10)).to_string(),
            "EXACT_STALENESS 10s"
        );
        assert_eq!(
            TimestampBound::MaxStaleness(Duration::from_millis(250)).to_string(),
            "MAX_STALENESS 250ms"
        );
    }

    #[test]
    fn test_single_use_only_modes() {
        assert!(TimestampBound::MaxStaleness(Duration::from_secs(5)).is_only_valid_for_single_use());
        assert!(
            TimestampBound::MinReadTimestamp(Timestamp::now()).is_only_valid_for_single_use()
        );
        assert!(!TimestampBound::Strong.is_only_valid_for_single_use());
        assert!(
            !TimestampBound::ExactStaleness(Duration::from_secs(5)).is_only_valid_for_single_use()
        );
    }
}
