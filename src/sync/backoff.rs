use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::Operation;

/// Exponential backoff between attempts of one operation:
/// `min(base * 2^(retry_count - 1), max)`, measured from its last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Earliest time `op` may be attempted again. None if it never failed.
    pub fn ready_at(&self, op: &Operation) -> Option<DateTime<Utc>> {
        let last = op.last_attempt?;
        if op.retry_count == 0 {
            return None;
        }
        let wait = chrono::Duration::from_std(self.delay(op.retry_count)).ok()?;
        last.checked_add_signed(wait)
    }

    pub fn is_due(&self, op: &Operation, now: DateTime<Utc>) -> bool {
        self.ready_at(op).map_or(true, |at| now >= at)
    }
}
