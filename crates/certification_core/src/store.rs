//! Persistence seams for sessions and certificate audit records.
//!
//! Both traits report failures as plain strings; the engine maps them into
//! [`WorkflowError::Store`](crate::error::WorkflowError::Store).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::certificate::CertificateRecord;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Another writer moved the stored version first.
    Conflict,
}

pub trait SessionStore {
    fn get(&self, document: &str) -> Result<Option<Session>, String>;

    /// Writes `session` only if the stored version still equals
    /// `expected_version`. `None` means the item must not exist yet.
    fn put(&self, session: &Session, expected_version: Option<u64>) -> Result<PutOutcome, String>;

    fn delete(&self, document: &str) -> Result<(), String>;
}

pub trait CertificateStore {
    fn insert(&self, record: &CertificateRecord) -> Result<(), String>;
    fn update(&self, record: &CertificateRecord) -> Result<(), String>;
    /// Newest first.
    fn list_for_document(&self, document: &str) -> Result<Vec<CertificateRecord>, String>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, document: &str) -> Result<Option<Session>, String> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| "session store lock poisoned".to_string())?;
        Ok(sessions.get(document).cloned())
    }

    fn put(&self, session: &Session, expected_version: Option<u64>) -> Result<PutOutcome, String> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| "session store lock poisoned".to_string())?;
        let stored_version = sessions.get(&session.document).map(|stored| stored.version);
        if stored_version != expected_version {
            return Ok(PutOutcome::Conflict);
        }
        sessions.insert(session.document.clone(), session.clone());
        Ok(PutOutcome::Written)
    }

    fn delete(&self, document: &str) -> Result<(), String> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| "session store lock poisoned".to_string())?;
        sessions.remove(document);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCertificateStore {
    records: Mutex<Vec<CertificateRecord>>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<CertificateRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl CertificateStore for InMemoryCertificateStore {
    fn insert(&self, record: &CertificateRecord) -> Result<(), String> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| "certificate store lock poisoned".to_string())?;
        if records.iter().any(|existing| existing.request_id == record.request_id) {
            return Err(format!("certificate {} already exists", record.request_id));
        }
        records.push(record.clone());
        Ok(())
    }

    fn update(&self, record: &CertificateRecord) -> Result<(), String> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| "certificate store lock poisoned".to_string())?;
        let existing = records
            .iter_mut()
            .find(|existing| existing.request_id == record.request_id)
            .ok_or_else(|| format!("certificate {} not found", record.request_id))?;
        *existing = record.clone();
        Ok(())
    }

    fn list_for_document(&self, document: &str) -> Result<Vec<CertificateRecord>, String> {
        let records = self
            .records
            .lock()
            .map_err(|_| "certificate store lock poisoned".to_string())?;
        let mut matching: Vec<_> = records
            .iter()
            .filter(|record| record.document == document)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};

    use super::*;
    use crate::certificate::CertificateStatus;
    use crate::contract::DocumentType;

    fn session(version: u64) -> Session {
        let mut session = Session::start("123", DocumentType::CC, 3, DateTime::<Utc>::UNIX_EPOCH);
        session.version = version;
        session
    }

    #[test]
    fn put_is_conditional_on_version() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.put(&session(1), None), Ok(PutOutcome::Written));
        assert_eq!(store.put(&session(2), None), Ok(PutOutcome::Conflict));
        assert_eq!(store.put(&session(2), Some(7)), Ok(PutOutcome::Conflict));
        assert_eq!(store.put(&session(2), Some(1)), Ok(PutOutcome::Written));

        let stored = store.get("123").expect("get").expect("session exists");
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn delete_then_create_starts_over() {
        let store = InMemorySessionStore::new();
        store.put(&session(1), None).expect("create");
        store.delete("123").expect("delete");
        assert!(store.is_empty());
        assert_eq!(store.put(&session(1), None), Ok(PutOutcome::Written));
    }

    #[test]
    fn certificate_history_is_newest_first_and_scoped() {
        let store = InMemoryCertificateStore::new();
        let base = DateTime::<Utc>::UNIX_EPOCH;
        let mut first = CertificateRecord::pending("123", DocumentType::CC, "Ana", "AAA1", base);
        let second = CertificateRecord::pending(
            "123",
            DocumentType::CC,
            "Ana",
            "AAA2",
            base + TimeDelta::seconds(5),
        );
        let other = CertificateRecord::pending("456", DocumentType::CC, "Luis", "BBB1", base);
        store.insert(&first).expect("insert first");
        store.insert(&second).expect("insert second");
        store.insert(&other).expect("insert other");
        assert!(store.insert(&first).is_err());

        first.status = CertificateStatus::Sent;
        store.update(&first).expect("update first");

        let history = store.list_for_document("123").expect("history");
        let chips: Vec<_> = history.iter().map(|record| record.chip.as_str()).collect();
        assert_eq!(chips, vec!["AAA2", "AAA1"]);
        assert_eq!(history[1].status, CertificateStatus::Sent);
    }
}
