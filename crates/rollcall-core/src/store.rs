//! Persistence collaborator contract, plus an in-memory implementation.

use crate::types::{AttendanceEvent, AttendanceRecord, AttendanceStatus, Identity};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("identity id already enrolled: {0}")]
    DuplicateId(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("corrupt row for {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Inclusive calendar-date filter for attendance reports. Absent bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: Some(date),
            end: Some(date),
        }
    }

    pub fn contains(&self, timestamp: &NaiveDateTime) -> bool {
        let date = timestamp.date();
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Identities and attendance events, as seen by the core.
///
/// Implementations must enforce id uniqueness on insert and cascade
/// attendance rows when an identity is deleted.
pub trait AttendanceStore {
    fn load_identities(&self) -> Result<Vec<Identity>, StoreError>;
    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError>;
    fn identity_exists(&self, id: &str) -> Result<bool, StoreError>;
    /// Fails with [`StoreError::DuplicateId`] if the id is taken.
    fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError>;
    /// Fails with [`StoreError::NotFound`] if there is no such identity.
    fn delete_identity(&self, id: &str) -> Result<(), StoreError>;
    fn append_attendance(
        &self,
        identity_id: &str,
        timestamp: NaiveDateTime,
    ) -> Result<AttendanceEvent, StoreError>;
    /// Records in range, most recent first.
    fn query_attendance(&self, range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<Identity>,
    attendance: Vec<(i64, AttendanceEvent)>,
    next_row: i64,
}

/// Process-local store, used as a test double.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }
}

impl AttendanceStore for MemoryStore {
    fn load_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.lock()?.identities.clone())
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.lock()?.identities.iter().find(|i| i.id == id).cloned())
    }

    fn identity_exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.identities.iter().any(|i| i.id == id))
    }

    fn insert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.identities.iter().any(|i| i.id == identity.id) {
            return Err(StoreError::DuplicateId(identity.id.clone()));
        }
        state.identities.push(identity.clone());
        Ok(())
    }

    fn delete_identity(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let before = state.identities.len();
        state.identities.retain(|i| i.id != id);
        if state.identities.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        state.attendance.retain(|(_, e)| e.identity_id != id);
        Ok(())
    }

    fn append_attendance(
        &self,
        identity_id: &str,
        timestamp: NaiveDateTime,
    ) -> Result<AttendanceEvent, StoreError> {
        let mut state = self.lock()?;
        if !state.identities.iter().any(|i| i.id == identity_id) {
            return Err(StoreError::Write(format!("unknown identity {identity_id}")));
        }
        state.next_row += 1;
        let row = state.next_row;
        let event = AttendanceEvent {
            identity_id: identity_id.to_string(),
            timestamp,
            status: AttendanceStatus::Present,
        };
        state.attendance.push((row, event.clone()));
        Ok(event)
    }

    fn query_attendance(&self, range: &DateRange) -> Result<Vec<AttendanceRecord>, StoreError> {
        let state = self.lock()?;
        let mut records: Vec<AttendanceRecord> = state
            .attendance
            .iter()
            .filter(|(_, e)| range.contains(&e.timestamp))
            .filter_map(|(row, e)| {
                let identity = state.identities.iter().find(|i| i.id == e.identity_id)?;
                Some(AttendanceRecord {
                    id: *row,
                    identity_id: e.identity_id.clone(),
                    display_name: identity.display_name.clone(),
                    timestamp: e.timestamp,
                    status: e.status,
                })
            })
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding_at;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.into(),
            display_name: format!("name-{id}"),
            encoding: encoding_at(0.0),
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = MemoryStore::new();
        store.insert_identity(&identity("u1")).unwrap();
        assert!(matches!(
            store.insert_identity(&identity("u1")),
            Err(StoreError::DuplicateId(id)) if id == "u1"
        ));
        assert!(store.identity_exists("u1").unwrap());
        assert!(!store.identity_exists("u2").unwrap());
    }

    #[test]
    fn test_query_orders_most_recent_first() {
        let store = MemoryStore::new();
        store.insert_identity(&identity("u1")).unwrap();
        store.append_attendance("u1", at("2025-07-20", "09:00:00")).unwrap();
        store.append_attendance("u1", at("2025-07-21", "09:00:00")).unwrap();

        let records = store.query_attendance(&DateRange::all()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, at("2025-07-21", "09:00:00"));
        assert_eq!(records[0].display_name, "name-u1");
    }

    #[test]
    fn test_date_range_inclusive() {
        let day = NaiveDate::from_ymd_opt(2025, 7, 20).unwrap();
        let range = DateRange::day(day);
        assert!(range.contains(&at("2025-07-20", "00:00:00")));
        assert!(range.contains(&at("2025-07-20", "23:59:59")));
        assert!(!range.contains(&at("2025-07-21", "00:00:00")));
    }

    #[test]
    fn test_delete_cascades() {
        let store = MemoryStore::new();
        store.insert_identity(&identity("u1")).unwrap();
        store.insert_identity(&identity("u2")).unwrap();
        store.append_attendance("u1", at("2025-07-20", "09:00:00")).unwrap();
        store.append_attendance("u2", at("2025-07-20", "09:05:00")).unwrap();

        store.delete_identity("u1").unwrap();
        let records = store.query_attendance(&DateRange::all()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity_id, "u2");
        assert!(store.get_identity("u1").unwrap().is_none());
        assert!(matches!(store.delete_identity("u1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_append_for_unknown_identity_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.append_attendance("ghost", at("2025-07-20", "09:00:00")),
            Err(StoreError::Write(_))
        ));
    }
}
