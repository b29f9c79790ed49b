use std::collections::HashMap;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::clock::format_timestamp;
use crate::types::AttendanceRecord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
    #[error("attendance store rejected write: {0}")]
    WriteRejected(String),
    #[error("no record for id {0}")]
    UnknownId(String),
    #[error("attendance store call timed out")]
    Timeout,
}

/// One writable field of an attendance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordField {
    TotalAttendance(u32),
    LastAttendanceTime(NaiveDateTime),
}

/// The attendance store as seen by the record updater.
///
/// No transactional guarantee is required: read-then-write from two devices
/// may both succeed for the same debounce window.
pub trait AttendanceStore {
    fn get(&mut self, id: &str) -> Result<Option<AttendanceRecord>, StoreError>;

    fn set(&mut self, id: &str, field: RecordField) -> Result<(), StoreError>;

    /// Write a new total and timestamp for `id`.
    ///
    /// The default issues two `set` calls, total first. Backends with
    /// transactions should override this so both fields land together.
    fn record_attendance(
        &mut self,
        id: &str,
        total: u32,
        at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        self.set(id, RecordField::TotalAttendance(total))?;
        self.set(id, RecordField::LastAttendanceTime(at))
    }
}

impl<S: AttendanceStore + ?Sized> AttendanceStore for Box<S> {
    fn get(&mut self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).get(id)
    }

    fn set(&mut self, id: &str, field: RecordField) -> Result<(), StoreError> {
        (**self).set(id, field)
    }

    fn record_attendance(
        &mut self,
        id: &str,
        total: u32,
        at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        (**self).record_attendance(id, total, at)
    }
}

/// In-process store keyed by student id.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: HashMap<String, AttendanceRecord>,
    reads: usize,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AttendanceRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn record(&self, id: &str) -> Option<&AttendanceRecord> {
        self.records.get(id)
    }

    /// Number of `get` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of `set` calls applied so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl AttendanceStore for MemoryStore {
    fn get(&mut self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        self.reads += 1;
        Ok(self.records.get(id).cloned())
    }

    fn set(&mut self, id: &str, field: RecordField) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;
        match field {
            RecordField::TotalAttendance(total) => record.total_attendance = total,
            RecordField::LastAttendanceTime(at) => {
                record.last_attendance_time = format_timestamp(&at)
            }
        }
        self.writes += 1;
        Ok(())
    }
}
