use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use rollcall_core::clock::format_timestamp;
use rollcall_core::{
    AttendanceRecord, AttendanceStore, Embedding, KnownFace, RecordField,
    StoreError as AttendanceStoreError,
};

/// Face encodings are 128-dimensional.
pub const EMBEDDING_DIM: usize = 128;
const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;
const NONCE_LEN: usize = 12;

/// `last_attendance_time` for a student who has never been recorded.
pub const NEVER_ATTENDED: &str = "1970-01-01 00:00:00";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("unknown student: {0}")]
    UnknownStudent(String),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed (key mismatch or corrupted data)")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected 128)")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// One accepted attendance write, as kept in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub student_id: String,
    pub recorded_at: String,
}

/// SQLite-backed attendance store and roster.
///
/// Holds the student records the state machine reads and updates, the
/// enrolled face encodings (AES-256-GCM encrypted with a per-installation key
/// at `{db_dir}/.key`), and an append-only log of accepted writes.
///
/// Owned by the engine thread; every call is synchronous and bounded by the
/// SQLite busy timeout.
pub struct SqliteStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");

        let enc_key = if in_memory {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let dir = db_path.parent().unwrap_or(Path::new("/var/lib/rollcall"));
            std::fs::create_dir_all(dir).map_err(StoreError::KeyIo)?;
            load_or_generate_key(&dir.join(".key"))?
        };

        let conn = if in_memory {
            Connection::open_in_memory()?
        } else {
            Connection::open(db_path)?
        };
        conn.busy_timeout(busy_timeout)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS students (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 major TEXT NOT NULL DEFAULT '',
                 standing TEXT NOT NULL DEFAULT '',
                 year INTEGER NOT NULL DEFAULT 0,
                 starting_year INTEGER NOT NULL DEFAULT 0,
                 total_attendance INTEGER NOT NULL DEFAULT 0,
                 last_attendance_time TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS faces (
                 id TEXT PRIMARY KEY,
                 student_id TEXT NOT NULL REFERENCES students(id) ON DELETE CASCADE,
                 embedding BLOB NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_faces_student ON faces(student_id);
             CREATE TABLE IF NOT EXISTS attendance_log (
                 id TEXT PRIMARY KEY,
                 student_id TEXT NOT NULL,
                 recorded_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_log_student ON attendance_log(student_id);",
        )?;

        Ok(Self { conn, enc_key })
    }

    /// Insert a student or replace every field of an existing one.
    pub fn upsert_student(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO students (id, name, major, standing, year, starting_year, total_attendance, last_attendance_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 major = excluded.major,
                 standing = excluded.standing,
                 year = excluded.year,
                 starting_year = excluded.starting_year,
                 total_attendance = excluded.total_attendance,
                 last_attendance_time = excluded.last_attendance_time",
            rusqlite::params![
                record.id,
                record.name,
                record.major,
                record.standing,
                record.year,
                record.starting_year,
                record.total_attendance,
                record.last_attendance_time,
            ],
        )?;
        Ok(())
    }

    pub fn student(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, major, standing, year, starting_year, total_attendance, last_attendance_time
                 FROM students WHERE id = ?1",
                [id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_students(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, major, standing, year, starting_year, total_attendance, last_attendance_time
             FROM students ORDER BY id",
        )?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Enroll one face encoding for an existing student. Returns the generated UUID.
    pub fn add_face(&self, student_id: &str, embedding: &Embedding) -> Result<String, StoreError> {
        if self.student(student_id)?.is_none() {
            return Err(StoreError::UnknownStudent(student_id.to_string()));
        }

        let blob = self.encrypt_embedding(&embedding.values)?;
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO faces (id, student_id, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, student_id, blob, created_at],
        )?;
        Ok(id)
    }

    /// Every enrolled encoding, decrypted, in enrollment order.
    pub fn load_roster(&self) -> Result<Vec<KnownFace>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id, embedding FROM faces ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut roster = Vec::with_capacity(rows.len());
        for (student_id, blob) in rows {
            let values = self.decrypt_embedding(&blob)?;
            roster.push(KnownFace {
                id: student_id,
                embedding: Embedding::new(values),
            });
        }
        Ok(roster)
    }

    pub fn count_faces(&self) -> Result<u64, StoreError> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent accepted writes for a student, newest first.
    pub fn history(&self, student_id: &str, limit: u32) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, student_id, recorded_at FROM attendance_log
             WHERE student_id = ?1 ORDER BY recorded_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![student_id, limit], |row| {
            Ok(AttendanceEvent {
                id: row.get(0)?,
                student_id: row.get(1)?,
                recorded_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding(&plaintext)
    }
}

impl AttendanceStore for SqliteStore {
    fn get(&mut self, id: &str) -> Result<Option<AttendanceRecord>, AttendanceStoreError> {
        self.student(id).map_err(|e| match e {
            StoreError::Db(e) => map_db_error(e, false),
            other => AttendanceStoreError::Unavailable(other.to_string()),
        })
    }

    fn set(&mut self, id: &str, field: RecordField) -> Result<(), AttendanceStoreError> {
        let affected = match field {
            RecordField::TotalAttendance(total) => self.conn.execute(
                "UPDATE students SET total_attendance = ?1 WHERE id = ?2",
                rusqlite::params![total, id],
            ),
            RecordField::LastAttendanceTime(at) => self.conn.execute(
                "UPDATE students SET last_attendance_time = ?1 WHERE id = ?2",
                rusqlite::params![format_timestamp(&at), id],
            ),
        }
        .map_err(|e| map_db_error(e, true))?;

        if affected == 0 {
            return Err(AttendanceStoreError::UnknownId(id.to_string()));
        }
        Ok(())
    }

    /// Both fields and the audit row land in one transaction.
    fn record_attendance(
        &mut self,
        id: &str,
        total: u32,
        at: NaiveDateTime,
    ) -> Result<(), AttendanceStoreError> {
        let at = format_timestamp(&at);
        let tx = self.conn.transaction().map_err(|e| map_db_error(e, true))?;

        let affected = tx
            .execute(
                "UPDATE students SET total_attendance = ?1, last_attendance_time = ?2 WHERE id = ?3",
                rusqlite::params![total, at, id],
            )
            .map_err(|e| map_db_error(e, true))?;
        if affected == 0 {
            return Err(AttendanceStoreError::UnknownId(id.to_string()));
        }

        tx.execute(
            "INSERT INTO attendance_log (id, student_id, recorded_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![uuid::Uuid::new_v4().to_string(), id, at],
        )
        .map_err(|e| map_db_error(e, true))?;

        tx.commit().map_err(|e| map_db_error(e, true))
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        major: row.get(2)?,
        standing: row.get(3)?,
        year: row.get(4)?,
        starting_year: row.get(5)?,
        total_attendance: row.get(6)?,
        last_attendance_time: row.get(7)?,
    })
}

/// Busy/locked means the timeout budget ran out; everything else is a
/// read or write failure.
fn map_db_error(e: rusqlite::Error, write: bool) -> AttendanceStoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return AttendanceStoreError::Timeout;
        }
    }
    if write {
        AttendanceStoreError::WriteRejected(e.to_string())
    } else {
        AttendanceStoreError::Unavailable(e.to_string())
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(key_path)
        .map_err(StoreError::KeyIo)?;
    f.write_all(&key).map_err(StoreError::KeyIo)?;

    tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
    Ok(key)
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    validate_embedding_values(&values)?;
    Ok(values)
}

pub fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::clock::parse_timestamp;

    fn open() -> SqliteStore {
        SqliteStore::open(Path::new(":memory:"), Duration::from_secs(1)).unwrap()
    }

    fn student(id: &str) -> AttendanceRecord {
        AttendanceRecord {
            id: id.to_string(),
            name: "Mary Jackson".to_string(),
            major: "Aerospace Engineering".to_string(),
            standing: "G".to_string(),
            year: 2,
            starting_year: 2023,
            total_attendance: 4,
            last_attendance_time: "2024-09-01 12:00:00".to_string(),
        }
    }

    fn embedding(seed: f32) -> Embedding {
        Embedding::new(
            (0..EMBEDDING_DIM)
                .map(|i| seed + i as f32 / EMBEDDING_DIM as f32)
                .collect(),
        )
    }

    #[test]
    fn test_student_roundtrip() {
        let store = open();
        store.upsert_student(&student("S001")).unwrap();
        assert_eq!(store.student("S001").unwrap(), Some(student("S001")));
        assert_eq!(store.student("S404").unwrap(), None);
    }

    #[test]
    fn test_upsert_replaces() {
        let store = open();
        store.upsert_student(&student("S001")).unwrap();
        let mut changed = student("S001");
        changed.major = "Mathematics".to_string();
        store.upsert_student(&changed).unwrap();

        let all = store.list_students().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].major, "Mathematics");
    }

    #[test]
    fn test_attendance_store_get_and_set() {
        let mut store = open();
        store.upsert_student(&student("S001")).unwrap();

        let record = AttendanceStore::get(&mut store, "S001").unwrap().unwrap();
        assert_eq!(record.total_attendance, 4);

        store
            .set("S001", RecordField::TotalAttendance(9))
            .unwrap();
        assert_eq!(store.student("S001").unwrap().unwrap().total_attendance, 9);

        let err = store
            .set("S404", RecordField::TotalAttendance(1))
            .unwrap_err();
        assert_eq!(err, AttendanceStoreError::UnknownId("S404".to_string()));
    }

    #[test]
    fn test_record_attendance_is_logged() {
        let mut store = open();
        store.upsert_student(&student("S001")).unwrap();
        let at = parse_timestamp("2024-09-02 08:00:00").unwrap();
        store.record_attendance("S001", 5, at).unwrap();

        let record = store.student("S001").unwrap().unwrap();
        assert_eq!(record.total_attendance, 5);
        assert_eq!(record.last_attendance_time, "2024-09-02 08:00:00");

        let history = store.history("S001", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].recorded_at, "2024-09-02 08:00:00");
    }

    #[test]
    fn test_record_attendance_unknown_student_rolls_back() {
        let mut store = open();
        let at = parse_timestamp("2024-09-02 08:00:00").unwrap();
        let err = store.record_attendance("S404", 1, at).unwrap_err();
        assert_eq!(err, AttendanceStoreError::UnknownId("S404".to_string()));
        assert!(store.history("S404", 10).unwrap().is_empty());
    }

    #[test]
    fn test_history_newest_first_and_limited() {
        let mut store = open();
        store.upsert_student(&student("S001")).unwrap();
        for (i, t) in ["2024-09-02 08:00:00", "2024-09-03 08:00:00", "2024-09-04 08:00:00"]
            .iter()
            .enumerate()
        {
            store
                .record_attendance("S001", 5 + i as u32, parse_timestamp(t).unwrap())
                .unwrap();
        }
        let history = store.history("S001", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].recorded_at, "2024-09-04 08:00:00");
        assert_eq!(history[1].recorded_at, "2024-09-03 08:00:00");
    }

    #[test]
    fn test_roster_roundtrip() {
        let store = open();
        store.upsert_student(&student("S001")).unwrap();
        store.upsert_student(&student("S002")).unwrap();
        store.add_face("S001", &embedding(0.0)).unwrap();
        store.add_face("S002", &embedding(1.0)).unwrap();

        let roster = store.load_roster().unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(store.count_faces().unwrap(), 2);
        let s002 = roster.iter().find(|f| f.id == "S002").unwrap();
        for (orig, rec) in embedding(1.0).values.iter().zip(s002.embedding.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[test]
    fn test_add_face_requires_student() {
        let store = open();
        let err = store.add_face("S404", &embedding(0.0)).unwrap_err();
        assert!(matches!(err, StoreError::UnknownStudent(_)));
    }

    #[test]
    fn test_add_face_rejects_bad_embedding() {
        let store = open();
        store.upsert_student(&student("S001")).unwrap();

        let short = Embedding::new(vec![0.5; 64]);
        assert!(matches!(
            store.add_face("S001", &short).unwrap_err(),
            StoreError::InvalidEmbeddingDim(64)
        ));

        let mut values = vec![0.5; EMBEDDING_DIM];
        values[7] = f32::NAN;
        assert!(matches!(
            store.add_face("S001", &Embedding::new(values)).unwrap_err(),
            StoreError::InvalidEmbeddingValue
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let store1 = open();
        let store2 = SqliteStore {
            conn: Connection::open_in_memory().unwrap(),
            enc_key: [2u8; 32],
        };
        let blob = store1.encrypt_embedding(&embedding(0.0).values).unwrap();
        assert!(matches!(
            store2.decrypt_embedding(&blob),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_ciphertext_differs_per_enrollment() {
        let store = open();
        let values = embedding(0.0).values;
        let a = store.encrypt_embedding(&values).unwrap();
        let b = store.encrypt_embedding(&values).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), NONCE_LEN + EMBEDDING_BYTE_LEN + 16);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let store = open();
        assert!(matches!(
            store.decrypt_embedding(&[0u8; 8]),
            Err(StoreError::InvalidBlob(8))
        ));
    }
}
