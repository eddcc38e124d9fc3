//! Time normalization: minute truncation, instant text format, and the
//! business timezone.
//!
//! Every instant that reaches a booking or an unavailability block goes
//! through [`normalize_to_minute`] first, so two drags released a few
//! hundred milliseconds apart inside the same minute compare equal.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{MINUTE_MS, Ms, Span};

pub const DEFAULT_TIMEZONE: &str = "America/Mexico_City";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    Parse(String),
    OutOfRange(Ms),
    UnknownZone(String),
    Nonexistent(NaiveDateTime),
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::Parse(s) => write!(f, "invalid timestamp: {s:?}"),
            TimeError::OutOfRange(ms) => write!(f, "timestamp out of range: {ms}"),
            TimeError::UnknownZone(z) => write!(f, "unknown timezone: {z}"),
            TimeError::Nonexistent(t) => write!(f, "local time {t} does not exist"),
        }
    }
}

impl std::error::Error for TimeError {}

/// Truncate to the start of the minute. Rounds toward negative infinity,
/// so pre-epoch instants land on their own minute too.
pub fn normalize_to_minute(t: Ms) -> Ms {
    t - t.rem_euclid(MINUTE_MS)
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an absolute instant: RFC 3339 (`2026-10-16T10:00:00Z`) or the
/// Postgres text form (`2026-10-16 10:00:00+00`). The offset is mandatory;
/// a bare wall-clock time is not an instant.
pub fn parse_instant(s: &str) -> Result<Ms, TimeError> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| TimeError::Parse(s.to_string()))
}

pub fn format_instant(t: Ms) -> String {
    match DateTime::from_timestamp_millis(t) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => t.to_string(),
    }
}

/// A fixed IANA zone for the shop. Conversions delegate to the tz database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessZone {
    tz: Tz,
}

impl Default for BusinessZone {
    fn default() -> Self {
        Self { tz: chrono_tz::America::Mexico_City }
    }
}

impl BusinessZone {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self, TimeError> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| TimeError::UnknownZone(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    /// Wall-clock time in the shop → absolute instant.
    ///
    /// Ambiguous times (clocks going back) take the earlier instant. Times
    /// inside a gap (clocks going forward) move to the first instant after it.
    pub fn to_utc(&self, local: NaiveDateTime) -> Result<Ms, TimeError> {
        if let Some(dt) = self.tz.from_local_datetime(&local).earliest() {
            return Ok(dt.timestamp_millis());
        }
        // Gaps are at most an hour in every zone we care about; step forward.
        let mut candidate = local;
        for _ in 0..120 {
            candidate += TimeDelta::minutes(1);
            if let Some(dt) = self.tz.from_local_datetime(&candidate).earliest() {
                return Ok(dt.timestamp_millis());
            }
        }
        Err(TimeError::Nonexistent(local))
    }

    pub fn to_local(&self, t: Ms) -> Result<NaiveDateTime, TimeError> {
        DateTime::from_timestamp_millis(t)
            .map(|dt| dt.with_timezone(&self.tz).naive_local())
            .ok_or(TimeError::OutOfRange(t))
    }

    pub fn local_date(&self, t: Ms) -> Result<NaiveDate, TimeError> {
        self.to_local(t).map(|dt| dt.date())
    }

    /// `[local midnight, next local midnight)` as absolute instants.
    pub fn day_bounds(&self, date: NaiveDate) -> Result<Span, TimeError> {
        let next = date
            .succ_opt()
            .ok_or_else(|| TimeError::Parse(date.to_string()))?;
        let start = self.to_utc(date.and_time(chrono::NaiveTime::MIN))?;
        let end = self.to_utc(next.and_time(chrono::NaiveTime::MIN))?;
        Ok(Span::new(start, end))
    }
}
