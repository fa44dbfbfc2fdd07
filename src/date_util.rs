use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of "now". Injected so backoff and timestamps are deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Format a timestamp the way it is stored: RFC 3339, UTC, microseconds.
/// Fixed width, so string order matches time order.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Read a stored timestamp column, surfacing bad text as a conversion error.
pub fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_iso(&raw).ok_or_else(|| bad_text(idx, format!("invalid timestamp: {raw}")))
}

pub fn opt_ts_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_iso(&raw)
            .map(Some)
            .ok_or_else(|| bad_text(idx, format!("invalid timestamp: {raw}"))),
    }
}

pub(crate) fn bad_text(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_iso_round_trip_keeps_order() {
        let a = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(to_iso(a) < to_iso(b));
        assert_eq!(parse_iso(&to_iso(a)), Some(a));
        assert_eq!(to_iso(a), "2025-01-15T10:30:00.000000Z");
    }

    #[test]
    fn test_parse_iso_rejects_garbage() {
        assert_eq!(parse_iso("yesterday"), None);
        assert!(parse_iso("2025-01-15T10:30:00+02:00").is_some());
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(8));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(8));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
