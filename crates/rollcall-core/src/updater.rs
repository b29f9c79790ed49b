//! Time-gated read-modify-write of a student's attendance record.

use std::time::Duration;

use crate::clock::{format_timestamp, parse_timestamp, truncate_to_secs, Clock};
use crate::config::DEFAULT_DEBOUNCE;
use crate::store::{AttendanceStore, StoreError};
use crate::types::AttendanceRecord;

/// Why a resolved id produced no record.
#[derive(Debug, Clone, PartialEq)]
pub enum NotFoundReason {
    /// The store has no entry: the roster and the store disagree.
    Missing,
    /// `last_attendance_time` could not be parsed.
    ClockParse(String),
    /// The store could not be read.
    StoreUnavailable(StoreError),
}

/// Result of one [`RecordUpdater::update`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Attendance was recorded; carries the updated record for display.
    WrittenOrFresh(AttendanceRecord),
    /// The write failed after a successful read. Nothing was counted;
    /// carries the pre-write record for display.
    WriteFailed {
        record: AttendanceRecord,
        error: StoreError,
    },
    /// Already recorded within the debounce interval. The store is untouched.
    TooSoon { elapsed_secs: f64 },
    NotFound(NotFoundReason),
}

impl UpdateOutcome {
    /// The record to show, if this outcome leads to the info phase.
    pub fn display_record(&self) -> Option<&AttendanceRecord> {
        match self {
            UpdateOutcome::WrittenOrFresh(record) => Some(record),
            UpdateOutcome::WriteFailed { record, .. } => Some(record),
            UpdateOutcome::TooSoon { .. } | UpdateOutcome::NotFound(_) => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, UpdateOutcome::WrittenOrFresh(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateOutcome::WrittenOrFresh(_) => "written",
            UpdateOutcome::WriteFailed { .. } => "write_failed",
            UpdateOutcome::TooSoon { .. } => "too_soon",
            UpdateOutcome::NotFound(_) => "not_found",
        }
    }
}

/// Records attendance at most once per debounce interval per student.
#[derive(Debug, Clone, Copy)]
pub struct RecordUpdater {
    debounce: Duration,
}

impl Default for RecordUpdater {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl RecordUpdater {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Read the record for `id`, and if the last attendance is older than the
    /// debounce interval, increment the total and stamp the current time.
    ///
    /// Never fails: every store or parse error maps to an outcome.
    pub fn update<S, C>(&self, store: &mut S, clock: &C, id: &str) -> UpdateOutcome
    where
        S: AttendanceStore + ?Sized,
        C: Clock + ?Sized,
    {
        let record = match store.get(id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(id, "no attendance record for recognised face");
                return UpdateOutcome::NotFound(NotFoundReason::Missing);
            }
            Err(e) => {
                tracing::error!(id, error = %e, "attendance store read failed");
                return UpdateOutcome::NotFound(NotFoundReason::StoreUnavailable(e));
            }
        };

        let last = match parse_timestamp(&record.last_attendance_time) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(
                    id,
                    value = %record.last_attendance_time,
                    error = %e,
                    "unparseable last_attendance_time"
                );
                return UpdateOutcome::NotFound(NotFoundReason::ClockParse(
                    record.last_attendance_time,
                ));
            }
        };

        let now = truncate_to_secs(clock.now());
        let elapsed_secs = (now - last).num_milliseconds() as f64 / 1000.0;

        if elapsed_secs < 0.0 {
            tracing::warn!(
                id,
                elapsed_secs,
                "last attendance lies in the future; store and device clocks disagree"
            );
        }

        if elapsed_secs <= self.debounce.as_secs_f64() {
            tracing::info!(id, elapsed_secs, "attendance already recorded recently");
            return UpdateOutcome::TooSoon { elapsed_secs };
        }

        let total = record.total_attendance.saturating_add(1);
        if let Err(error) = store.record_attendance(id, total, now) {
            tracing::error!(id, error = %error, "attendance write failed; not counted");
            return UpdateOutcome::WriteFailed { record, error };
        }

        tracing::info!(id, total, elapsed_secs, "attendance recorded");
        UpdateOutcome::WrittenOrFresh(AttendanceRecord {
            total_attendance: total,
            last_attendance_time: format_timestamp(&now),
            ..record
        })
    }
}
