//! Deterministic fakes shared by unit tests, integration scenarios and benches.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::certificate::{CertificateRecord, CertificateService, DispatchReceipt};
use crate::clock::Clock;
use crate::contract::DocumentType;
use crate::error::CollaboratorError;
use crate::identity::{IdentityService, IdentityVerdict};
use crate::otp::{CitizenProfile, OtpService, OtpVerdict};
use crate::policy::WorkflowPolicy;
use crate::property::{
    normalize_chip, normalize_registration, PropertyRecord, PropertyRegistry, SearchCriteria,
};
use crate::quota::InMemoryQuotaLedger;
use crate::session::Session;
use crate::state::WorkflowState;
use crate::store::{
    CertificateStore, InMemoryCertificateStore, InMemorySessionStore, PutOutcome, SessionStore,
};
use crate::workflow::{EngineDeps, WorkflowEngine};

pub const TEST_FULL_NAME: &str = "Ana Pérez";
pub const TEST_EMAIL: &str = "ana.perez@example.com";
pub const TEST_OTP_CODE: &str = "1234";

/// Clock that only moves when told to. `sleep` is recorded, not waited.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn at_epoch() -> Self {
        Self::at(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().expect("poisoned mutex");
        *now += by;
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.advance(TimeDelta::seconds(seconds));
    }

    pub fn slept(&self) -> Duration {
        *self.slept.lock().expect("poisoned mutex")
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("poisoned mutex")
    }

    fn sleep(&self, duration: Duration) {
        *self.slept.lock().expect("poisoned mutex") += duration;
    }
}

/// Pops a scripted failure if one is queued.
fn next_scripted(queue: &Mutex<VecDeque<CollaboratorError>>) -> Option<CollaboratorError> {
    queue.lock().expect("poisoned mutex").pop_front()
}

fn push_scripted(queue: &Mutex<VecDeque<CollaboratorError>>, error: CollaboratorError, times: usize) {
    let mut queue = queue.lock().expect("poisoned mutex");
    for _ in 0..times {
        queue.push_back(error.clone());
    }
}

#[derive(Debug, Default)]
pub struct FakeIdentityService {
    unknown: Mutex<HashSet<String>>,
    dispatches_otp: Mutex<bool>,
    failures: Mutex<VecDeque<CollaboratorError>>,
    calls: Mutex<usize>,
}

impl FakeIdentityService {
    pub fn mark_unknown(&self, document: &str) {
        self.unknown
            .lock()
            .expect("poisoned mutex")
            .insert(document.to_string());
    }

    /// Mirrors identity services that send the temporary key themselves.
    pub fn dispatch_otp_on_verify(&self, enabled: bool) {
        *self.dispatches_otp.lock().expect("poisoned mutex") = enabled;
    }

    pub fn fail_next(&self, error: CollaboratorError, times: usize) {
        push_scripted(&self.failures, error, times);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("poisoned mutex")
    }
}

impl IdentityService for FakeIdentityService {
    fn verify(
        &self,
        document: &str,
        _document_type: DocumentType,
    ) -> Result<IdentityVerdict, CollaboratorError> {
        *self.calls.lock().expect("poisoned mutex") += 1;
        if let Some(error) = next_scripted(&self.failures) {
            return Err(error);
        }
        if self.unknown.lock().expect("poisoned mutex").contains(document) {
            return Ok(IdentityVerdict::rejected("document is not registered"));
        }
        Ok(IdentityVerdict {
            valid: true,
            name: Some(TEST_FULL_NAME.to_string()),
            email: Some(TEST_EMAIL.to_string()),
            masked_email: None,
            message: None,
            otp_dispatched: *self.dispatches_otp.lock().expect("poisoned mutex"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtpScript {
    Accept { expires_in_secs: Option<u64> },
    Reject,
    Expire,
    Lock,
}

/// Accepts [`TEST_OTP_CODE`] unless a rejection is queued; any other code is rejected.
#[derive(Debug, Default)]
pub struct ScriptedOtpService {
    script: Mutex<VecDeque<OtpScript>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
    issued: Mutex<usize>,
    verified: Mutex<usize>,
}

impl ScriptedOtpService {
    pub fn reject_next(&self, times: usize) {
        let mut script = self.script.lock().expect("poisoned mutex");
        for _ in 0..times {
            script.push_back(OtpScript::Reject);
        }
    }

    /// Accepts the next code and reports the given token lifetime.
    pub fn accept_next_with_lifetime(&self, expires_in_secs: Option<u64>) {
        self.script
            .lock()
            .expect("poisoned mutex")
            .push_back(OtpScript::Accept { expires_in_secs });
    }

    pub fn expire_next(&self) {
        self.script
            .lock()
            .expect("poisoned mutex")
            .push_back(OtpScript::Expire);
    }

    pub fn lock_next(&self) {
        self.script
            .lock()
            .expect("poisoned mutex")
            .push_back(OtpScript::Lock);
    }

    pub fn fail_next(&self, error: CollaboratorError, times: usize) {
        push_scripted(&self.failures, error, times);
    }

    pub fn issued(&self) -> usize {
        *self.issued.lock().expect("poisoned mutex")
    }

    pub fn verified(&self) -> usize {
        *self.verified.lock().expect("poisoned mutex")
    }
}

impl OtpService for ScriptedOtpService {
    fn issue(&self, _document: &str, _document_type: DocumentType) -> Result<(), CollaboratorError> {
        if let Some(error) = next_scripted(&self.failures) {
            return Err(error);
        }
        *self.issued.lock().expect("poisoned mutex") += 1;
        Ok(())
    }

    fn verify(
        &self,
        document: &str,
        _document_type: DocumentType,
        code: &str,
    ) -> Result<OtpVerdict, CollaboratorError> {
        *self.verified.lock().expect("poisoned mutex") += 1;
        if let Some(error) = next_scripted(&self.failures) {
            return Err(error);
        }
        let scripted = self.script.lock().expect("poisoned mutex").pop_front();
        match scripted {
            Some(OtpScript::Reject) => Ok(OtpVerdict::Rejected {
                message: "incorrect code".to_string(),
            }),
            Some(OtpScript::Expire) => Ok(OtpVerdict::Expired {
                message: "the temporary key expired".to_string(),
            }),
            Some(OtpScript::Lock) => Ok(OtpVerdict::Locked {
                message: "account locked".to_string(),
            }),
            Some(OtpScript::Accept { expires_in_secs }) => Ok(accepted(document, expires_in_secs)),
            None if code == TEST_OTP_CODE => Ok(accepted(document, Some(600))),
            None => Ok(OtpVerdict::Rejected {
                message: "incorrect code".to_string(),
            }),
        }
    }
}

fn accepted(document: &str, expires_in_secs: Option<u64>) -> OtpVerdict {
    OtpVerdict::Accepted {
        token: format!("token-{document}"),
        expires_in_secs,
        profile: Some(CitizenProfile {
            name: Some(TEST_FULL_NAME.to_string()),
            email: Some(TEST_EMAIL.to_string()),
        }),
    }
}

/// Synthetic portfolio: property `n` has CHIP `AAA000000000n`, a street address
/// and a `050C` registration number.
pub fn sample_property(index: usize) -> PropertyRecord {
    let mut record = PropertyRecord::new(format!("AAA{:010}", index + 1));
    record.address = Some(format!("CL {} # 10-{}", index + 1, index + 20));
    record.registration = Some(format!("050C-{:07}", index + 1));
    record
}

pub fn sample_chip(index: usize) -> String {
    sample_property(index).chip
}

#[derive(Debug, Default)]
pub struct FakePropertyRegistry {
    portfolio: Mutex<Vec<PropertyRecord>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
    tokens: Mutex<Vec<String>>,
}

impl FakePropertyRegistry {
    pub fn with_portfolio(size: usize) -> Self {
        let registry = Self::default();
        registry.set_portfolio(size);
        registry
    }

    pub fn set_portfolio(&self, size: usize) {
        *self.portfolio.lock().expect("poisoned mutex") = (0..size).map(sample_property).collect();
    }

    pub fn fail_next(&self, error: CollaboratorError, times: usize) {
        push_scripted(&self.failures, error, times);
    }

    /// Bearer tokens seen, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("poisoned mutex").clone()
    }

    fn enter(&self, token: &str) -> Result<Vec<PropertyRecord>, CollaboratorError> {
        self.tokens
            .lock()
            .expect("poisoned mutex")
            .push(token.to_string());
        if let Some(error) = next_scripted(&self.failures) {
            return Err(error);
        }
        Ok(self.portfolio.lock().expect("poisoned mutex").clone())
    }
}

impl PropertyRegistry for FakePropertyRegistry {
    fn count(&self, token: &str) -> Result<u32, CollaboratorError> {
        let portfolio = self.enter(token)?;
        Ok(u32::try_from(portfolio.len()).unwrap_or(u32::MAX))
    }

    fn list(&self, token: &str) -> Result<Vec<PropertyRecord>, CollaboratorError> {
        self.enter(token)
    }

    fn search(
        &self,
        token: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<PropertyRecord>, CollaboratorError> {
        let portfolio = self.enter(token)?;
        Ok(portfolio
            .into_iter()
            .filter(|record| match criteria {
                SearchCriteria::Chip { chip } => normalize_chip(&record.chip) == *chip,
                SearchCriteria::Address { address } => record
                    .address
                    .as_deref()
                    .is_some_and(|value| value.eq_ignore_ascii_case(address)),
                SearchCriteria::Registration { number, .. } => record
                    .registration
                    .as_deref()
                    .is_some_and(|value| normalize_registration(value) == *number),
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct RecordingCertificateService {
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingCertificateService {
    pub fn failing_for(chips: &[&str]) -> Self {
        Self {
            failing: chips.iter().map(|chip| chip.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("poisoned mutex").clone()
    }
}

impl CertificateService for RecordingCertificateService {
    fn generate(&self, _token: &str, chip: &str) -> Result<DispatchReceipt, CollaboratorError> {
        self.calls
            .lock()
            .expect("poisoned mutex")
            .push(chip.to_string());
        if self.failing.contains(chip) {
            return Err(CollaboratorError::Unavailable(format!(
                "certificate generation for {chip} timed out"
            )));
        }
        Ok(DispatchReceipt {
            request_number: Some(format!("RAD-{chip}")),
        })
    }
}

/// In-memory audit store whose next N updates fail.
#[derive(Debug, Default)]
pub struct FlakyCertificateStore {
    inner: InMemoryCertificateStore,
    failing_updates: Mutex<usize>,
}

impl FlakyCertificateStore {
    pub fn fail_updates(&self, count: usize) {
        *self.failing_updates.lock().expect("poisoned mutex") = count;
    }

    pub fn all(&self) -> Vec<CertificateRecord> {
        self.inner.all()
    }
}

impl CertificateStore for FlakyCertificateStore {
    fn insert(&self, record: &CertificateRecord) -> Result<(), String> {
        self.inner.insert(record)
    }

    fn update(&self, record: &CertificateRecord) -> Result<(), String> {
        let mut failing = self.failing_updates.lock().expect("poisoned mutex");
        if *failing > 0 {
            *failing -= 1;
            return Err("throttled".to_string());
        }
        drop(failing);
        self.inner.update(record)
    }

    fn list_for_document(&self, document: &str) -> Result<Vec<CertificateRecord>, String> {
        self.inner.list_for_document(document)
    }
}

/// In-memory session store that can be told to lose the next N conditional writes.
#[derive(Debug, Default)]
pub struct ContendedSessionStore {
    inner: InMemorySessionStore,
    forced_conflicts: Mutex<u32>,
}

impl ContendedSessionStore {
    pub fn force_conflicts(&self, count: u32) {
        *self.forced_conflicts.lock().expect("poisoned mutex") = count;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stored(&self, document: &str) -> Option<Session> {
        self.inner.get(document).expect("in-memory get")
    }

    /// Writes `session` unconditionally, bypassing the version check.
    pub fn overwrite(&self, session: &Session) {
        let current = self.stored(&session.document).map(|stored| stored.version);
        let outcome = self.inner.put(session, current).expect("in-memory put");
        assert_eq!(outcome, PutOutcome::Written);
    }
}

impl SessionStore for ContendedSessionStore {
    fn get(&self, document: &str) -> Result<Option<Session>, String> {
        self.inner.get(document)
    }

    fn put(&self, session: &Session, expected_version: Option<u64>) -> Result<PutOutcome, String> {
        let mut forced = self.forced_conflicts.lock().expect("poisoned mutex");
        if *forced > 0 {
            *forced -= 1;
            return Ok(PutOutcome::Conflict);
        }
        drop(forced);
        self.inner.put(session, expected_version)
    }

    fn delete(&self, document: &str) -> Result<(), String> {
        self.inner.delete(document)
    }
}

/// Owns one of every fake and hands out engines borrowing them.
#[derive(Debug)]
pub struct TestHarness {
    pub sessions: ContendedSessionStore,
    pub certificates: FlakyCertificateStore,
    pub quota: InMemoryQuotaLedger,
    pub identity: FakeIdentityService,
    pub otp: ScriptedOtpService,
    pub registry: FakePropertyRegistry,
    pub dispatcher: RecordingCertificateService,
    pub clock: ManualClock,
    pub policy: WorkflowPolicy,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Four properties, default policy, clock at 2026-02-14 12:00 UTC.
    pub fn new() -> Self {
        Self::with_portfolio(4)
    }

    pub fn with_portfolio(size: usize) -> Self {
        let noon = DateTime::parse_from_rfc3339("2026-02-14T12:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        Self {
            sessions: ContendedSessionStore::default(),
            certificates: FlakyCertificateStore::default(),
            quota: InMemoryQuotaLedger::new(),
            identity: FakeIdentityService::default(),
            otp: ScriptedOtpService::default(),
            registry: FakePropertyRegistry::with_portfolio(size),
            dispatcher: RecordingCertificateService::default(),
            clock: ManualClock::at(noon),
            policy: WorkflowPolicy::default(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: RecordingCertificateService) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn engine(&self) -> WorkflowEngine<'_> {
        WorkflowEngine::new(
            EngineDeps {
                sessions: &self.sessions,
                certificates: &self.certificates,
                quota: &self.quota,
                identity: &self.identity,
                otp: &self.otp,
                registry: &self.registry,
                dispatcher: &self.dispatcher,
                clock: &self.clock,
            },
            self.policy.clone(),
        )
    }

    pub fn sessions_conflict_next(&self, count: u32) {
        self.sessions.force_conflicts(count);
    }

    pub fn state_of(&self, document: &str) -> Option<WorkflowState> {
        self.sessions.stored(document).map(|session| session.state)
    }

    pub fn reach_identity_validated(&self, document: &str) {
        let engine = self.engine();
        engine
            .accept_consent(document, DocumentType::CC, true)
            .expect("consent accepted");
        engine
            .validate_identity(document)
            .expect("identity validated");
    }

    pub fn reach_otp_validated(&self, document: &str) {
        self.reach_identity_validated(document);
        self.engine()
            .validate_otp(document, TEST_OTP_CODE)
            .expect("otp validated");
    }

    /// Counts and lists the portfolio; requires the listing branch.
    pub fn reach_properties_listed(&self, document: &str) {
        self.reach_otp_validated(document);
        let engine = self.engine();
        engine.count_properties(document).expect("properties counted");
        engine.list_properties(document).expect("properties listed");
    }

    pub fn reach_selection_validated(&self, document: &str, chips: &[String]) {
        self.reach_properties_listed(document);
        let engine = self.engine();
        engine
            .select_properties(document, chips)
            .expect("properties selected");
        engine
            .validate_selection(document, true)
            .expect("selection validated");
    }
}
