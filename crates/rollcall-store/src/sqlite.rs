//! SQLite-backed [`AttendanceStore`].

use chrono::{NaiveDateTime, Timelike};
use rollcall_core::store::{AttendanceStore, DateRange, StoreError};
use rollcall_core::types::{
    AttendanceEvent, AttendanceRecord, AttendanceStatus, Encoding, Identity,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        face_encoding BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES users (user_id) ON DELETE CASCADE,
        timestamp TEXT NOT NULL,
        status TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS attendance_user ON attendance (user_id);
    CREATE INDEX IF NOT EXISTS attendance_timestamp ON attendance (timestamp);
";

/// Identities and attendance rows in a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("{}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))
    }
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn write_err(e: rusqlite::Error) -> StoreError {
    StoreError::Write(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn parse_timestamp(id: &str, raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("bad timestamp {raw:?}: {e}"),
    })
}

fn decode_identity(user_id: String, name: String, blob: Vec<u8>) -> Result<Identity, StoreError> {
    let encoding = Encoding::from_bytes(&blob).map_err(|e| StoreError::Corrupt {
        id: user_id.clone(),
        reason: e.to_string(),
    })?;
    Ok(Identity {
        id: user_id,
        display_name: name,
        encoding,
    })
}

impl AttendanceStore for SqliteStore {
    fn load_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id, name, face_encoding FROM users ORDER BY rowid")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
            })
            .map_err(query_err)?;

        let mut identities = Vec::new();
        for row in rows {
            let (user_id, name, blob) = row.map_err(query_err)?;
            identities.push(decode_identity(user_id, name, blob)?);
        }
        Ok(identities)
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT user_id, name, face_encoding FROM users WHERE user_id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?)),
            )
            .optional()
            .map_err(query_err)?;
        row.map(|(user_id, name, blob)| decode_identity(user_id, name, blob))
            .transpose()
    }

    fn identity_exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
            params![id],
            |row| row.get::<_, bool>(0),
        )
        .map_err(query_err)
    }

    fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, name, face_encoding) VALUES (?1, ?2, ?3)",
            params![identity.id, identity.display_name, identity.encoding.to_bytes()],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateId(identity.id.clone())
            } else {
                write_err(e)
            }
        })?;
        tracing::info!(id = %identity.id, name = %identity.display_name, "identity inserted");
        Ok(())
    }

    fn delete_identity(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(write_err)?;
        let attendance = tx
            .execute("DELETE FROM attendance WHERE user_id = ?1", params![id])
            .map_err(write_err)?;
        let users = tx
            .execute("DELETE FROM users WHERE user_id = ?1", params![id])
            .map_err(write_err)?;
        if users == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit().map_err(write_err)?;
        tracing::info!(id, attendance_rows = attendance, "identity deleted");
        Ok(())
    }

    fn append_attendance(
        &self,
        identity_id: &str,
        timestamp: NaiveDateTime,
    ) -> Result<AttendanceEvent, StoreError> {
        let conn = self.conn()?;
        let status = AttendanceStatus::Present;
        conn.execute(
            "INSERT INTO attendance (user_id, timestamp, status) VALUES (?1, ?2, ?3)",
            params![
                identity_id,
                timestamp.format(TIMESTAMP_FORMAT).to_string(),
                status.as_str()
            ],
        )
        .map_err(write_err)?;
        // Stored at second precision; report what was stored.
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        Ok(AttendanceEvent {
            identity_id: identity_id.to_string(),
            timestamp,
            status,
        })
    }

    fn query_attendance(&self, range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT a.id, a.user_id, u.name, a.timestamp, a.status
             FROM attendance a
             JOIN users u ON a.user_id = u.user_id",
        );
        let mut bounds: Vec<String> = Vec::new();
        let mut clauses: Vec<&str> = Vec::new();
        if let Some(start) = range.start {
            clauses.push("DATE(a.timestamp) >= ?");
            bounds.push(start.format(DATE_FORMAT).to_string());
        }
        if let Some(end) = range.end {
            clauses.push("DATE(a.timestamp) <= ?");
            bounds.push(end.format(DATE_FORMAT).to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY a.timestamp DESC, a.id DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(bounds.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(query_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, identity_id, display_name, raw_ts, raw_status) = row.map_err(query_err)?;
            let timestamp = parse_timestamp(&identity_id, &raw_ts)?;
            let status = raw_status
                .parse::<AttendanceStatus>()
                .map_err(|reason| StoreError::Corrupt {
                    id: identity_id.clone(),
                    reason,
                })?;
            records.push(AttendanceRecord {
                id,
                identity_id,
                display_name,
                timestamp,
                status,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use rollcall_core::types::ENCODING_DIM;

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).unwrap()
    }

    fn identity(id: &str, name: &str, seed: f64) -> Identity {
        let values = (0..ENCODING_DIM).map(|i| seed + i as f64 * 1e-3).collect();
        Identity {
            id: id.into(),
            display_name: name.into(),
            encoding: Encoding::new(values).unwrap(),
        }
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_identity(&identity("U001", "John Doe", 0.1)).unwrap();
        store.insert_identity(&identity("U002", "Jane Smith", 0.2)).unwrap();
        store.insert_identity(&identity("U003", "Peter Jones", 0.3)).unwrap();
        store
    }

    #[test]
    fn test_encoding_survives_round_trip_through_blob() {
        let store = seeded();
        let loaded = store.get_identity("U002").unwrap().unwrap();
        assert_eq!(loaded.display_name, "Jane Smith");
        assert_abs_diff_eq!(loaded.encoding.values()[5], 0.205, epsilon = 1e-12);
        assert!(store.get_identity("U404").unwrap().is_none());
    }

    #[test]
    fn test_load_keeps_insertion_order() {
        let ids: Vec<String> = seeded().load_identities().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["U001", "U002", "U003"]);
    }

    #[test]
    fn test_empty_database_loads_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_identities().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = seeded();
        let result = store.insert_identity(&identity("U001", "John Doe Duplicate", 0.9));
        assert!(matches!(result, Err(StoreError::DuplicateId(ref id)) if id == "U001"));
        assert_eq!(store.get_identity("U001").unwrap().unwrap().display_name, "John Doe");
        assert!(store.identity_exists("U001").unwrap());
        assert!(!store.identity_exists("U999").unwrap());
    }

    #[test]
    fn test_attendance_for_unknown_identity_fails() {
        let store = seeded();
        assert!(matches!(
            store.append_attendance("ghost", at("2025-07-20 09:00:00")),
            Err(StoreError::Write(_))
        ));
    }

    #[test]
    fn test_query_by_date_range() {
        let store = seeded();
        store.append_attendance("U001", at("2025-07-20 09:00:00")).unwrap();
        store.append_attendance("U003", at("2025-07-20 09:05:00")).unwrap();
        store.append_attendance("U001", at("2025-07-21 08:30:00")).unwrap();
        store.append_attendance("U002", at("2025-07-22 10:00:00")).unwrap();

        let all = store.query_attendance(&DateRange::all()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].identity_id, "U002");
        assert_eq!(all[3].timestamp, at("2025-07-20 09:00:00"));

        let day = NaiveDate::from_ymd_opt(2025, 7, 20).unwrap();
        let on_day = store.query_attendance(&DateRange::day(day)).unwrap();
        assert_eq!(on_day.len(), 2);
        assert_eq!(on_day[0].display_name, "Peter Jones");
        assert_eq!(on_day[0].status, AttendanceStatus::Present);

        let from = DateRange { start: NaiveDate::from_ymd_opt(2025, 7, 21), end: None };
        assert_eq!(store.query_attendance(&from).unwrap().len(), 2);

        let until = DateRange { start: None, end: NaiveDate::from_ymd_opt(2025, 7, 21) };
        assert_eq!(store.query_attendance(&until).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_cascades_attendance() {
        let store = seeded();
        store.append_attendance("U003", at("2025-07-20 09:05:00")).unwrap();
        store.append_attendance("U001", at("2025-07-20 09:10:00")).unwrap();

        store.delete_identity("U003").unwrap();

        assert!(store.get_identity("U003").unwrap().is_none());
        let records = store.query_attendance(&DateRange::all()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity_id, "U001");
        assert!(matches!(store.delete_identity("U003"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_timestamps_truncate_to_seconds() {
        let store = seeded();
        let precise = at("2025-07-20 09:00:00") + chrono::Duration::milliseconds(750);
        let event = store.append_attendance("U001", precise).unwrap();
        assert_eq!(event.timestamp, at("2025-07-20 09:00:00"));
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_identity(&identity("U001", "John Doe", 0.1)).unwrap();
            store.append_attendance("U001", at("2025-07-20 09:00:00")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_identities().unwrap().len(), 1);
        assert_eq!(store.query_attendance(&DateRange::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let result = SqliteStore::open(dir.path());
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO users (user_id, name, face_encoding) VALUES ('bad', 'Bad', x'0011')",
                [],
            )
            .unwrap();
        assert!(matches!(store.load_identities(), Err(StoreError::Corrupt { ref id, .. }) if id == "bad"));
    }
}
