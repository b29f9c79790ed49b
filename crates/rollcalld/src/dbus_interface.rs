use serde::Deserialize;
use zbus::interface;

use rollcall_core::clock::parse_timestamp;
use rollcall_core::{AttendanceRecord, Embedding};

use crate::engine::EngineHandle;
use crate::store::{validate_embedding_values, NEVER_ATTENDED};

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub session_bus: bool,
}

/// Student details accepted by `UpsertStudent`. Counters default to a
/// student who has never been marked present.
#[derive(Debug, Deserialize)]
struct StudentInput {
    id: String,
    name: String,
    #[serde(default)]
    major: String,
    #[serde(default)]
    standing: String,
    #[serde(default)]
    year: u32,
    #[serde(default)]
    starting_year: u32,
    #[serde(default)]
    total_attendance: u32,
    #[serde(default)]
    last_attendance_time: Option<String>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn parse_student(json: &str) -> zbus::fdo::Result<AttendanceRecord> {
    let input: StudentInput = serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid student: {e}")))?;
    if input.id.trim().is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("student id is empty".into()));
    }
    let last_attendance_time = input
        .last_attendance_time
        .unwrap_or_else(|| NEVER_ATTENDED.to_string());
    parse_timestamp(&last_attendance_time).map_err(|e| {
        zbus::fdo::Error::InvalidArgs(format!(
            "invalid last_attendance_time {last_attendance_time:?}: {e}"
        ))
    })?;

    Ok(AttendanceRecord {
        id: input.id,
        name: input.name,
        major: input.major,
        standing: input.standing,
        year: input.year,
        starting_year: input.starting_year,
        total_attendance: input.total_attendance,
        last_attendance_time,
    })
}

fn parse_embedding(json: &str) -> zbus::fdo::Result<Embedding> {
    let values: Vec<f32> = serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid embedding: {e}")))?;
    validate_embedding_values(&values).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
    Ok(Embedding::new(values))
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn).await.map_err(failed)?;
    let bus_name = zbus::names::BusName::try_from(sender_str).map_err(failed)?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(failed)
}

impl AttendanceService {
    /// Roster changes are root-only on the system bus. On the session bus
    /// (development mode) the check is skipped.
    async fn require_root(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        if self.session_bus {
            return Ok(());
        }
        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        if caller_uid != 0 {
            tracing::warn!(caller_uid, "roster change denied");
            return Err(zbus::fdo::Error::AccessDenied(
                "roster changes require root".to_string(),
            ));
        }
        Ok(())
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Session state as JSON: display mode, frame counter, liveness window,
    /// roster size and counters.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        let body = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
        });
        to_json(&body)
    }

    /// One student record as JSON, or `null` when the id is unknown.
    async fn get_student(&self, id: &str) -> zbus::fdo::Result<String> {
        let record = self.engine.student(id).await.map_err(|e| {
            tracing::error!(id, error = %e, "get_student failed");
            failed(e)
        })?;
        to_json(&record)
    }

    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let records = self.engine.students().await.map_err(failed)?;
        to_json(&records)
    }

    /// Create or replace a student record.
    async fn upsert_student(
        &self,
        student: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        self.require_root(&header, conn).await?;
        let record = parse_student(student)?;
        tracing::info!(id = %record.id, "upsert_student requested");
        self.engine.upsert_student(record).await.map_err(|e| {
            tracing::error!(error = %e, "upsert_student failed");
            failed(e)
        })?;
        Ok(true)
    }

    /// Enroll a face encoding (JSON array of 128 floats) for a student.
    ///
    /// Returns the UUID of the stored face.
    async fn add_face(
        &self,
        id: &str,
        embedding: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.require_root(&header, conn).await?;
        let embedding = parse_embedding(embedding)?;
        tracing::info!(id, "add_face requested");
        self.engine.add_face(id, embedding).await.map_err(|e| {
            tracing::error!(id, error = %e, "add_face failed");
            failed(e)
        })
    }

    /// Most recent accepted attendance events for a student, newest first.
    async fn history(&self, id: &str, limit: u32) -> zbus::fdo::Result<String> {
        let events = self.engine.history(id, limit).await.map_err(failed)?;
        to_json(&events)
    }
}
