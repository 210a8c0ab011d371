//! Time-of-day values and the clock abstraction.
//!
//! The original progression logic compared `HH:MM` strings
//! lexically, which breaks across midnight. [`TimeOfDay`] is a proper
//! value type: minutes since midnight with real ordering, wrap-aware
//! arithmetic, and strict parsing at the operator boundary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minutes in a civil day.
const MINUTES_PER_DAY: u16 = 24 * 60;

/// Errors from parsing operator-supplied time strings.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeParseError {
    /// The string is not in `HH:MM` form.
    #[error("invalid time string '{value}': expected HH:MM")]
    Malformed {
        /// The rejected input.
        value: String,
    },

    /// Hour or minute component out of range.
    #[error("time component out of range in '{value}': hour 0-23, minute 0-59")]
    OutOfRange {
        /// The rejected input.
        value: String,
    },
}

/// A wall-clock time of day with minute precision.
///
/// Ordering is the natural within-day ordering; callers that need to
/// reason across midnight use [`TimeOfDay::wrapping_add_minutes`] and
/// carry the date separately.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    /// Minutes since midnight, always `< 1440`.
    minutes: u16,
}

impl TimeOfDay {
    /// Creates a time of day from hour and minute components.
    ///
    /// Returns `None` if either component is out of range.
    #[must_use]
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: u16::from(hour) * 60 + u16::from(minute),
        })
    }

    /// Extracts the time of day from a zoned timestamp.
    #[must_use]
    pub fn from_datetime(dt: &DateTime<FixedOffset>) -> Self {
        Self {
            // Timelike components are always in range for a valid datetime.
            minutes: (dt.hour() * 60 + dt.minute()) as u16,
        }
    }

    /// Hour component (0-23).
    #[must_use]
    pub const fn hour(self) -> u8 {
        (self.minutes / 60) as u8
    }

    /// Minute component (0-59).
    #[must_use]
    pub const fn minute(self) -> u8 {
        (self.minutes % 60) as u8
    }

    /// Minutes since midnight.
    #[must_use]
    pub const fn minutes_from_midnight(self) -> u16 {
        self.minutes
    }

    /// Adds minutes, wrapping past midnight into the next day.
    #[must_use]
    pub fn wrapping_add_minutes(self, minutes: u32) -> Self {
        let total = (u32::from(self.minutes) + minutes) % u32::from(MINUTES_PER_DAY);
        Self {
            minutes: total as u16,
        }
    }

    /// Subtracts minutes, wrapping back past midnight.
    #[must_use]
    pub fn wrapping_sub_minutes(self, minutes: u32) -> Self {
        let day = u32::from(MINUTES_PER_DAY);
        let total = (u32::from(self.minutes) + day - (minutes % day)) % day;
        Self {
            minutes: total as u16,
        }
    }

    /// Whether this time falls within the half-open range `[from, to)`.
    ///
    /// Ranges never wrap here: a window with `from > to` is empty,
    /// which matches how blackout windows are derived (`from` is
    /// always computed by subtracting the lead from `to` on the same
    /// day the window is used).
    #[must_use]
    pub fn is_within(self, from: Self, to: Self) -> bool {
        from <= self && self < to
    }

    /// Anchors this time of day onto a date.
    #[must_use]
    pub fn on_date(self, date: NaiveDate) -> Option<NaiveDateTime> {
        date.and_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TimeParseError::Malformed {
            value: s.to_string(),
        };
        let (h, m) = s.split_once(':').ok_or_else(malformed)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(malformed());
        }
        let hour: u8 = h.parse().map_err(|_| malformed())?;
        let minute: u8 = m.parse().map_err(|_| malformed())?;
        Self::new(hour, minute).ok_or_else(|| TimeParseError::OutOfRange {
            value: s.to_string(),
        })
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Source of the current local time for the event.
///
/// The automation loop and every transition that looks at "now" go
/// through this trait so tests can drive the orchestrator with a
/// deterministic clock.
pub trait Clock: Send + Sync {
    /// Current instant in the event's local offset.
    fn now(&self) -> DateTime<FixedOffset>;

    /// Current local time of day.
    fn time_of_day(&self) -> TimeOfDay {
        TimeOfDay::from_datetime(&self.now())
    }

    /// Current local calendar date.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// System clock shifted to the event's configured UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Creates a system clock for the given offset from UTC, in hours.
    ///
    /// Offsets are clamped to the civil range (±23 hours); nonsensical
    /// configuration values are rejected earlier by config validation.
    #[must_use]
    pub fn with_offset_hours(hours: i32) -> Self {
        let secs = hours.clamp(-23, 23) * 3600;
        let offset = FixedOffset::east_opt(secs).expect("offset clamped to a valid range");
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Deterministic clock with a settable current instant.
///
/// Used by the test suites (core and daemon) to drive the orchestrator
/// through a scripted timeline; never wired up in production.
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<FixedOffset>>,
}

impl FixedClock {
    /// Creates a clock frozen at the given RFC 3339 instant.
    ///
    /// # Panics
    ///
    /// Panics on an unparseable timestamp; inputs are test literals.
    #[must_use]
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339).expect("valid test timestamp");
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Jumps the clock to a new instant.
    ///
    /// # Panics
    ///
    /// Panics on an unparseable timestamp.
    pub fn set(&self, rfc3339: &str) {
        let now = DateTime::parse_from_rfc3339(rfc3339).expect("valid test timestamp");
        *self.now.lock().expect("clock lock") = now;
    }

    /// Moves the clock forward by whole minutes.
    pub fn advance_minutes(&self, minutes: i64) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::minutes(minutes);
    }

    /// Moves the clock forward by seconds.
    pub fn advance_seconds(&self, seconds: i64) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::seconds(seconds);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().expect("clock lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        let t: TimeOfDay = "22:15".parse().unwrap();
        assert_eq!(t.hour(), 22);
        assert_eq!(t.minute(), 15);
        assert_eq!(t.to_string(), "22:15");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("2215".parse::<TimeOfDay>().is_err());
        assert!("9:5".parse::<TimeOfDay>().is_err());
        assert!("ab:cd".parse::<TimeOfDay>().is_err());
        assert!("".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert_eq!(
            "24:00".parse::<TimeOfDay>(),
            Err(TimeParseError::OutOfRange {
                value: "24:00".to_string()
            })
        );
        assert!("12:60".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric_not_lexical() {
        let a: TimeOfDay = "09:30".parse().unwrap();
        let b: TimeOfDay = "22:00".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_wrapping_add_crosses_midnight() {
        let t: TimeOfDay = "23:58".parse().unwrap();
        assert_eq!(t.wrapping_add_minutes(5).to_string(), "00:03");
    }

    #[test]
    fn test_wrapping_sub_crosses_midnight() {
        let t: TimeOfDay = "00:03".parse().unwrap();
        assert_eq!(t.wrapping_sub_minutes(7).to_string(), "23:56");
    }

    #[test]
    fn test_is_within_half_open() {
        let from: TimeOfDay = "21:56".parse().unwrap();
        let to: TimeOfDay = "22:00".parse().unwrap();
        assert!(!"21:55".parse::<TimeOfDay>().unwrap().is_within(from, to));
        assert!("21:56".parse::<TimeOfDay>().unwrap().is_within(from, to));
        assert!("21:59".parse::<TimeOfDay>().unwrap().is_within(from, to));
        assert!(!"22:00".parse::<TimeOfDay>().unwrap().is_within(from, to));
    }

    #[test]
    fn test_serde_uses_hhmm_string() {
        let t: TimeOfDay = "05:00".parse().unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"05:00\"");
        let back: TimeOfDay = serde_json::from_str("\"05:00\"").unwrap();
        assert_eq!(back, t);
    }
}
