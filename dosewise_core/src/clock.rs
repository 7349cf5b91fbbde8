//! Injectable time source.
//!
//! Everything in the engine asks a [`Clock`] for "now" so that decay and
//! scheduling can be tested without depending on wall-clock time.

use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use parking_lot::Mutex;

/// Provider of the current instant and the local UTC offset
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Offset of the user's local time zone at the given instant
    fn local_offset(&self, at: DateTime<Utc>) -> FixedOffset;

    /// Midnight of the local day containing `at`, expressed in UTC
    fn start_of_local_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        start_of_day(at, self.local_offset(at))
    }
}

/// Wall-clock time with the system's local time zone
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_offset(&self, at: DateTime<Utc>) -> FixedOffset {
        Local.offset_from_utc_datetime(&at.naive_utc()).fix()
    }
}

/// Settable clock with a fixed offset, for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_offset(now, Utc.fix())
    }

    pub fn with_offset(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn local_offset(&self, _at: DateTime<Utc>) -> FixedOffset {
        self.offset
    }
}

fn start_of_day(at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = at.with_timezone(&offset).date_naive();
    // A fixed offset has no DST gaps, so local midnight always exists.
    local_date
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(at)
}
