//! Clock abstraction.
//!
//! Everything time-dependent (entry ages, reputation expiry, blob time-boxes)
//! reads the time through [`Clock`] so tests can drive it deterministically.

use std::sync::Mutex;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Number of 100ns ticks between 1601-01-01 and the Unix epoch.
const FILE_TIME_UNIX_EPOCH_OFFSET: i128 = 116_444_736_000_000_000;

/// Source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
    /// Current time in UTC.
    fn utc_now(&self) -> OffsetDateTime;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A manually driven clock for tests.
#[derive(Debug)]
pub struct MemoryClock {
    now: Mutex<OffsetDateTime>,
}

impl MemoryClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start.to_offset(UtcOffset::UTC)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: OffsetDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = now.to_offset(UtcOffset::UTC);
    }

    /// Move the clock forward (or backward for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Default for MemoryClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH + Duration::days(20_000))
    }
}

impl Clock for MemoryClock {
    fn utc_now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a timestamp to Windows file time (100ns ticks since 1601-01-01 UTC).
pub fn to_file_time(time: OffsetDateTime) -> i64 {
    let ticks = time.unix_timestamp_nanos() / 100 + FILE_TIME_UNIX_EPOCH_OFFSET;
    i64::try_from(ticks).unwrap_or(if ticks < 0 { i64::MIN } else { i64::MAX })
}

/// Convert Windows file time back to a UTC timestamp.
pub fn from_file_time(file_time: i64) -> crate::Result<OffsetDateTime> {
    let nanos = (i128::from(file_time) - FILE_TIME_UNIX_EPOCH_OFFSET) * 100;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| crate::Error::InvalidTimestamp(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_clock_advance() {
        let clock = MemoryClock::new(OffsetDateTime::UNIX_EPOCH);
        clock.advance(Duration::minutes(30));
        assert_eq!(
            clock.utc_now(),
            OffsetDateTime::UNIX_EPOCH + Duration::minutes(30)
        );
    }

    #[test]
    fn test_file_time_epoch() {
        assert_eq!(
            to_file_time(OffsetDateTime::UNIX_EPOCH),
            116_444_736_000_000_000
        );
    }

    #[test]
    fn test_file_time_roundtrip() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(19_000) + Duration::nanoseconds(1200);
        let back = from_file_time(to_file_time(now)).unwrap();
        assert_eq!(back, now);
    }
}
