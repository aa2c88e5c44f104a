//! Per-citizen session record.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{DocumentType, SessionStatus, SESSION_RECORD_SCHEMA_VERSION};
use crate::otp::AuthToken;
use crate::policy::deadline;
use crate::property::{PropertyBranch, PropertyRecord};
use crate::state::WorkflowState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: Option<String>,
    pub email: Option<String>,
    pub masked_email: Option<String>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpState {
    pub attempts_remaining: u8,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl OtpState {
    pub fn fresh(attempts: u8) -> Self {
        Self {
            attempts_remaining: attempts,
            issued_at: None,
            expires_at: None,
            verified_at: None,
        }
    }

    pub fn code_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub document: String,
    pub document_type: DocumentType,
    pub state: WorkflowState,
    pub consent_accepted: bool,
    pub identity: Option<IdentityRecord>,
    pub otp: OtpState,
    pub auth: Option<AuthToken>,
    pub property_count: Option<u32>,
    pub branch: Option<PropertyBranch>,
    #[serde(default)]
    pub candidates: Vec<PropertyRecord>,
    #[serde(default)]
    pub selected: BTreeSet<String>,
    #[serde(default)]
    pub selection_confirmed: bool,
    /// Set once certificate dispatch has been claimed for this session.
    pub issue_claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every successful write.
    pub version: u64,
}

fn default_schema_version() -> String {
    SESSION_RECORD_SCHEMA_VERSION.to_string()
}

impl Session {
    pub fn start(
        document: impl Into<String>,
        document_type: DocumentType,
        otp_attempts: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: default_schema_version(),
            document: document.into(),
            document_type,
            state: WorkflowState::Start,
            consent_accepted: false,
            identity: None,
            otp: OtpState::fresh(otp_attempts),
            auth: None,
            property_count: None,
            branch: None,
            candidates: Vec::new(),
            selected: BTreeSet::new(),
            selection_confirmed: false,
            issue_claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn expires_at(&self, idle: TimeDelta) -> DateTime<Utc> {
        deadline(self.updated_at, idle)
    }

    /// Idle past the window. Exactly `idle` seconds of inactivity still counts as live.
    pub fn is_expired(&self, now: DateTime<Utc>, idle: TimeDelta) -> bool {
        now - self.updated_at > idle
    }

    pub fn bearer_token(&self, now: DateTime<Utc>) -> Option<&str> {
        self.auth
            .as_ref()
            .filter(|auth| auth.is_valid_at(now))
            .map(|auth| auth.token.as_str())
    }

    pub fn candidate(&self, chip: &str) -> Option<&PropertyRecord> {
        self.candidates
            .iter()
            .find(|candidate| candidate.normalized_chip() == chip)
    }

    pub fn status(&self, now: DateTime<Utc>, idle: TimeDelta) -> SessionStatus {
        let active = !self.is_expired(now, idle) && !self.state.is_terminal();
        SessionStatus {
            active,
            state: self.state,
            attempts_remaining: (self.state == WorkflowState::IdentityValidated)
                .then_some(self.otp.attempts_remaining),
            selected: self.selected.iter().cloned().collect(),
            expires_at: Some(self.expires_at(idle)),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn idle_window_is_exclusive() {
        let session = Session::start("123", DocumentType::CC, 3, epoch());
        let idle = TimeDelta::seconds(600);
        assert!(!session.is_expired(epoch() + TimeDelta::seconds(600), idle));
        assert!(session.is_expired(epoch() + TimeDelta::seconds(601), idle));
    }

    #[test]
    fn bearer_token_requires_live_auth() {
        let mut session = Session::start("123", DocumentType::CC, 3, epoch());
        assert_eq!(session.bearer_token(epoch()), None);

        session.auth = Some(AuthToken {
            token: "jwt".to_string(),
            expires_at: epoch() + TimeDelta::seconds(10),
        });
        assert_eq!(session.bearer_token(epoch()), Some("jwt"));
        assert_eq!(session.bearer_token(epoch() + TimeDelta::seconds(10)), None);
    }

    #[test]
    fn record_decodes_without_optional_collections() {
        let session = Session::start("123", DocumentType::CE, 3, epoch());
        let mut value = serde_json::to_value(&session).expect("session encodes");
        let object = value.as_object_mut().expect("session is an object");
        object.remove("candidates");
        object.remove("selected");
        object.remove("schema_version");

        let decoded: Session = serde_json::from_value(value).expect("session decodes");
        assert_eq!(decoded, session);
    }

    #[test]
    fn status_reports_attempts_only_while_awaiting_code() {
        let mut session = Session::start("123", DocumentType::CC, 3, epoch());
        let idle = TimeDelta::seconds(600);
        assert_eq!(session.status(epoch(), idle).attempts_remaining, None);

        session.state = WorkflowState::IdentityValidated;
        session.otp.attempts_remaining = 2;
        let status = session.status(epoch(), idle);
        assert!(status.active);
        assert_eq!(status.attempts_remaining, Some(2));
        assert_eq!(status.expires_at, Some(epoch() + idle));
    }
}
