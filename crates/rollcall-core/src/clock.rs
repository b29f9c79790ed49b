//! Injectable time source and the store's timestamp format.
//!
//! Stored timestamps are naive `YYYY-MM-DD HH:MM:SS` strings without a zone.
//! The clock decides which wall clock they mean: [`SystemClock::utc`] keeps
//! multi-device deployments consistent across DST changes,
//! [`SystemClock::local`] reads records written by local-time writers.

use std::cell::Cell;

use chrono::{Duration, Local, NaiveDateTime, Timelike, Utc};

/// Wire format of `last_attendance_time`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Utc,
    Local,
}

/// Wall clock, reading either UTC or the host's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemClock {
    zone: Zone,
}

impl SystemClock {
    pub fn utc() -> Self {
        Self { zone: Zone::Utc }
    }

    pub fn local() -> Self {
        Self { zone: Zone::Local }
    }

    pub fn is_utc(&self) -> bool {
        self.zone == Zone::Utc
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.zone {
            Zone::Utc => Utc::now().naive_utc(),
            Zone::Local => Local::now().naive_local(),
        }
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Cell<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Start at a parsed timestamp in the store format.
    pub fn at(timestamp: &str) -> Result<Self, chrono::ParseError> {
        parse_timestamp(timestamp).map(Self::new)
    }

    pub fn set(&self, now: NaiveDateTime) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
}

pub fn format_timestamp(t: &NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Drop sub-second precision, which the wire format cannot carry.
pub fn truncate_to_secs(t: NaiveDateTime) -> NaiveDateTime {
    t.with_nanosecond(0).unwrap_or(t)
}
