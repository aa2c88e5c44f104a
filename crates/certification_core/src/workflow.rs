//! Guarded step engine.
//!
//! Every operation follows the same shape: load a live snapshot and check the
//! transition guard, call the collaborator (with retry) against that snapshot,
//! then fold the result into the stored session through a versioned
//! read-modify-write. The guard is checked again inside the write so a
//! concurrent request for the same document cannot slip a step past it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::certificate::{
    CertificateIssuer, CertificateRecord, CertificateService, IssueReport, IssueRequest,
};
use crate::clock::Clock;
use crate::contract::{
    document_fingerprint, mask_email, masked_document, normalize_document, CountOutcome,
    DocumentType, IdentityOutcome, OtpOutcome, PropertiesOutcome, SelectionOutcome,
    SessionStatus, StepReport,
};
use crate::error::{Collaborator, CollaboratorError, WorkflowError};
use crate::identity::{IdentityService, IdentityVerdict};
use crate::otp::{validate_code_format, AuthToken, OtpService, OtpVerdict};
use crate::policy::{deadline, secs, WorkflowPolicy};
use crate::property::{
    branch_for_count, normalize_chip, PropertyBranch, PropertyRegistry, SearchCriteria,
};
use crate::quota::QuotaLedger;
use crate::retry::retry_upstream;
use crate::session::{IdentityRecord, OtpState, Session};
use crate::state::{guard, Step, WorkflowState};
use crate::store::{CertificateStore, PutOutcome, SessionStore};

/// Collaborators and stores the engine drives.
#[derive(Clone, Copy)]
pub struct EngineDeps<'a> {
    pub sessions: &'a dyn SessionStore,
    pub certificates: &'a dyn CertificateStore,
    pub quota: &'a dyn QuotaLedger,
    pub identity: &'a dyn IdentityService,
    pub otp: &'a dyn OtpService,
    pub registry: &'a dyn PropertyRegistry,
    pub dispatcher: &'a dyn CertificateService,
    pub clock: &'a dyn Clock,
}

pub struct WorkflowEngine<'a> {
    deps: EngineDeps<'a>,
    policy: WorkflowPolicy,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(deps: EngineDeps<'a>, policy: WorkflowPolicy) -> Self {
        Self { deps, policy }
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    /// Opens a session, or starts over when the stored one is idle-expired or finished.
    pub fn accept_consent(
        &self,
        document: &str,
        document_type: DocumentType,
        accepted: bool,
    ) -> Result<StepReport, WorkflowError> {
        let document = normalize_document(document)?;
        if !accepted {
            return Err(WorkflowError::validation(
                Step::AcceptConsent,
                "data processing consent is required to request certificates",
            ));
        }

        for _ in 0..=self.policy.store_conflict_retries {
            let now = self.deps.clock.now();
            let existing = self.load(&document)?;
            let expected_version = existing.as_ref().map(|session| session.version);
            let reusable = existing.filter(|session| {
                !session.is_expired(now, self.policy.session_idle()) && !session.state.is_terminal()
            });

            let mut session = match reusable {
                Some(session) => {
                    guard(session.state, Step::AcceptConsent)?;
                    session
                }
                None => Session::start(&document, document_type, self.policy.otp_attempts, now),
            };
            session.document_type = document_type;
            session.consent_accepted = true;
            session.state = WorkflowState::ConsentGiven;
            session.last_error = None;
            session.updated_at = now;
            session.version = expected_version.map_or(1, |version| version + 1);

            match self
                .deps
                .sessions
                .put(&session, expected_version)
                .map_err(WorkflowError::Store)?
            {
                PutOutcome::Written => {
                    log_step(&session, Step::AcceptConsent);
                    return Ok(StepReport {
                        state: session.state,
                        message: "consent recorded; the identity document can now be validated"
                            .to_string(),
                    });
                }
                PutOutcome::Conflict => log_conflict(&document, Step::AcceptConsent),
            }
        }

        Err(self.conflicts_exhausted(&document))
    }

    /// Verifies the citizen with the identity service and sends the first code.
    pub fn validate_identity(&self, document: &str) -> Result<IdentityOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::ValidateIdentity;
        let snapshot = self.snapshot(&document, step)?;

        let verified = self
            .call(step, Collaborator::Identity, || {
                self.deps.identity.verify(&document, snapshot.document_type)
            })
            .and_then(|verdict| {
                if verdict.valid && !verdict.otp_dispatched {
                    self.call(step, Collaborator::Otp, || {
                        self.deps.otp.issue(&document, snapshot.document_type)
                    })?;
                }
                Ok(verdict)
            });

        self.upsert(&document, step, true, |session, now| {
            let verdict = verified.clone()?;
            if !verdict.valid {
                return Err(WorkflowError::validation(
                    step,
                    verdict
                        .message
                        .unwrap_or_else(|| "identity could not be verified".to_string()),
                ));
            }

            let identity = identity_record(&verdict, now);
            session.otp = OtpState {
                issued_at: Some(now),
                expires_at: Some(deadline(now, self.policy.otp_code_ttl())),
                ..OtpState::fresh(self.policy.otp_attempts)
            };
            let outcome = IdentityOutcome {
                state: WorkflowState::IdentityValidated,
                name: identity.name.clone(),
                masked_email: identity.masked_email.clone(),
                message: match &identity.masked_email {
                    Some(masked) => format!("identity verified; a 4-digit code was sent to {masked}"),
                    None => "identity verified; a 4-digit code was sent".to_string(),
                },
            };
            session.identity = Some(identity);
            Ok(outcome)
        })
    }

    /// Sends a fresh code. Remaining attempts are not replenished.
    pub fn resend_otp(&self, document: &str) -> Result<OtpOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::ResendOtp;
        let snapshot = self.snapshot(&document, step)?;

        let issued = self.call(step, Collaborator::Otp, || {
            self.deps.otp.issue(&document, snapshot.document_type)
        });

        self.upsert(&document, step, true, |session, now| {
            issued.clone()?;
            session.otp.issued_at = Some(now);
            session.otp.expires_at = Some(deadline(now, self.policy.otp_code_ttl()));
            Ok(OtpOutcome {
                state: WorkflowState::IdentityValidated,
                attempts_remaining: session.otp.attempts_remaining,
                message: "a new verification code was sent".to_string(),
            })
        })
    }

    pub fn validate_otp(&self, document: &str, code: &str) -> Result<OtpOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let code = validate_code_format(code)?;
        let step = Step::ValidateOtp;
        let snapshot = self.snapshot(&document, step)?;

        let now = self.deps.clock.now();
        let verdict = if snapshot.otp.code_expired(now) {
            Ok(OtpVerdict::Expired {
                message: "the verification code expired; request a new one".to_string(),
            })
        } else {
            self.call(step, Collaborator::Otp, || {
                self.deps.otp.verify(&document, snapshot.document_type, code)
            })
        };

        self.upsert(&document, step, true, |session, now| {
            if session.otp.code_expired(now) {
                return Err(WorkflowError::validation(
                    step,
                    "the verification code expired; request a new one",
                ));
            }

            match verdict.clone()? {
                OtpVerdict::Accepted {
                    token,
                    expires_in_secs,
                    profile,
                } => {
                    // Lifetimes past the representable range fall back to the default.
                    let expires_at = expires_in_secs
                        .map(secs)
                        .and_then(|ttl| now.checked_add_signed(ttl))
                        .unwrap_or_else(|| deadline(now, self.policy.auth_token_ttl()));
                    session.auth = Some(AuthToken { token, expires_at });
                    session.otp.attempts_remaining = self.policy.otp_attempts;
                    session.otp.verified_at = Some(now);
                    if let (Some(profile), Some(identity)) = (profile, session.identity.as_mut()) {
                        identity.name = identity.name.take().or(profile.name);
                        if identity.email.is_none() {
                            identity.masked_email = profile.email.as_deref().map(mask_email);
                            identity.email = profile.email;
                        }
                    }
                    Ok(OtpOutcome {
                        state: WorkflowState::OtpValidated,
                        attempts_remaining: session.otp.attempts_remaining,
                        message: "code verified; properties can now be queried".to_string(),
                    })
                }
                OtpVerdict::Rejected { message } => {
                    session.otp.attempts_remaining = session.otp.attempts_remaining.saturating_sub(1);
                    if session.otp.attempts_remaining == 0 {
                        return Err(WorkflowError::AttemptsExhausted);
                    }
                    Err(WorkflowError::validation(
                        step,
                        format!(
                            "{message}; {} attempt(s) remaining",
                            session.otp.attempts_remaining
                        ),
                    ))
                }
                OtpVerdict::Expired { message } => Err(WorkflowError::validation(step, message)),
                OtpVerdict::Locked { message } => {
                    tracing::warn!(
                        component = "workflow",
                        event = "otp_locked",
                        document = %masked_document(&document),
                        reason = %message,
                    );
                    Err(WorkflowError::AttemptsExhausted)
                }
            }
        })
    }

    pub fn count_properties(&self, document: &str) -> Result<CountOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::CountProperties;
        let snapshot = self.snapshot(&document, step)?;
        let token = self.require_token(&snapshot)?;

        let counted = self.call(step, Collaborator::PropertyRegistry, || {
            self.deps.registry.count(&token)
        });

        self.upsert(&document, step, true, |session, _| {
            let total = counted.clone()?;
            let branch = branch_for_count(total, self.policy.listing_threshold);
            session.property_count = Some(total);
            session.branch = Some(branch);
            session.candidates.clear();
            let message = match branch {
                PropertyBranch::NoProperties => {
                    "no properties are registered for this document; no certificates can be issued"
                        .to_string()
                }
                PropertyBranch::Listing => {
                    format!("{total} properties found; they can be listed for selection")
                }
                PropertyBranch::SearchOnly => format!(
                    "{total} properties found; search by CHIP code, address or registration number"
                ),
            };
            Ok(CountOutcome {
                state: WorkflowState::PropertiesQueried,
                total,
                branch,
                message,
            })
        })
    }

    pub fn list_properties(&self, document: &str) -> Result<PropertiesOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::ListProperties;
        let snapshot = self.snapshot(&document, step)?;
        if let Err(error) = expect_branch(&snapshot, step, PropertyBranch::Listing) {
            return self.fail(&document, step, error);
        }
        let token = self.require_token(&snapshot)?;

        let listed = self.call(step, Collaborator::PropertyRegistry, || {
            self.deps.registry.list(&token)
        });

        self.upsert(&document, step, true, |session, _| {
            expect_branch(session, step, PropertyBranch::Listing)?;
            let properties = listed.clone()?;
            if properties.is_empty() {
                return Err(WorkflowError::validation(
                    step,
                    "the registry returned no properties for this document",
                ));
            }
            session.candidates = properties.clone();
            Ok(PropertiesOutcome {
                state: WorkflowState::PropertiesResolved,
                total: properties.len(),
                message: format!(
                    "{} properties available; select up to {}",
                    properties.len(),
                    self.policy.max_selection
                ),
                properties,
            })
        })
    }

    /// Narrows a large portfolio. Matches accumulate across searches.
    pub fn search_properties(
        &self,
        document: &str,
        criteria: &SearchCriteria,
    ) -> Result<PropertiesOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::SearchProperties;
        let snapshot = self.snapshot(&document, step)?;
        if let Err(error) = expect_branch(&snapshot, step, PropertyBranch::SearchOnly) {
            return self.fail(&document, step, error);
        }
        let token = self.require_token(&snapshot)?;

        let found = self.call(step, Collaborator::PropertyRegistry, || {
            self.deps.registry.search(&token, criteria)
        });

        self.upsert(&document, step, true, |session, _| {
            expect_branch(session, step, PropertyBranch::SearchOnly)?;
            let matches = found.clone()?;
            if matches.is_empty() {
                return Err(WorkflowError::validation(
                    step,
                    format!("no property matched the {} search", criteria.method()),
                ));
            }
            for property in &matches {
                let chip = property.normalized_chip();
                if session.candidate(&chip).is_none() {
                    session.candidates.push(property.clone());
                }
            }
            Ok(PropertiesOutcome {
                state: WorkflowState::PropertiesResolved,
                total: matches.len(),
                message: format!(
                    "{} matching properties; select up to {}",
                    matches.len(),
                    self.policy.max_selection
                ),
                properties: matches,
            })
        })
    }

    pub fn select_properties(
        &self,
        document: &str,
        property_ids: &[String],
    ) -> Result<SelectionOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::SelectProperties;
        let chips: BTreeSet<String> = property_ids
            .iter()
            .map(|id| normalize_chip(id))
            .filter(|chip| !chip.is_empty())
            .collect();
        if chips.is_empty() {
            return Err(WorkflowError::InvalidInput(
                "at least one property must be selected".to_string(),
            ));
        }

        self.upsert(&document, step, true, |session, _| {
            if chips.len() > self.policy.max_selection {
                return Err(WorkflowError::validation(
                    step,
                    format!(
                        "at most {} properties can be selected per request",
                        self.policy.max_selection
                    ),
                ));
            }
            if let Some(unknown) = chips.iter().find(|chip| session.candidate(chip).is_none()) {
                return Err(WorkflowError::validation(
                    step,
                    format!("property {unknown} is not among the properties found"),
                ));
            }
            session.selected = chips.clone();
            session.selection_confirmed = false;
            Ok(SelectionOutcome {
                state: WorkflowState::SelectionMade,
                selected: chips.iter().cloned().collect(),
                remaining_quota: None,
                message: format!("{} properties selected; confirm to continue", chips.len()),
            })
        })
    }

    /// Confirms the selection and checks it against today's remaining quota.
    pub fn validate_selection(
        &self,
        document: &str,
        confirmed: bool,
    ) -> Result<SelectionOutcome, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::ValidateSelection;
        self.snapshot(&document, step)?;
        let remaining = self.issuer().remaining(&document)?;
        let limit = self.policy.daily_certificate_quota;

        self.upsert(&document, step, true, |session, _| {
            if !confirmed {
                return Err(WorkflowError::validation(
                    step,
                    "the selection was not confirmed; select the properties again",
                ));
            }
            let requested = u32::try_from(session.selected.len()).unwrap_or(u32::MAX);
            if requested > remaining {
                return Err(WorkflowError::QuotaExceeded {
                    used: limit.saturating_sub(remaining),
                    limit,
                    requested,
                });
            }
            session.selection_confirmed = true;
            Ok(SelectionOutcome {
                state: WorkflowState::SelectionValidated,
                selected: session.selected.iter().cloned().collect(),
                remaining_quota: Some(remaining),
                message: format!(
                    "selection confirmed; {remaining} certificate(s) available today"
                ),
            })
        })
    }

    /// Dispatches one certificate per selected property. Dispatch is claimed on
    /// the session first and never repeated for the same session. The claim is
    /// only released when the issuer refuses before dispatching anything.
    pub fn issue_certificates(
        &self,
        document: &str,
        full_name: Option<&str>,
    ) -> Result<IssueReport, WorkflowError> {
        let document = normalize_document(document)?;
        let step = Step::IssueCertificates;
        let snapshot = self.snapshot(&document, step)?;
        let full_name = full_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| snapshot.identity.as_ref().and_then(|identity| identity.name.clone()))
            .ok_or_else(|| {
                WorkflowError::InvalidInput("the citizen's full name is required".to_string())
            })?;
        let token = self.require_token(&snapshot)?;

        let chips: Vec<String> = self.upsert(&document, step, false, |session, now| {
            if session.issue_claimed_at.is_some() {
                return Err(WorkflowError::validation(
                    step,
                    "certificates for this session are already being issued",
                ));
            }
            session.issue_claimed_at = Some(now);
            Ok(session.selected.iter().cloned().collect())
        })?;

        let issued = self.issuer().issue(IssueRequest {
            document: &document,
            document_type: snapshot.document_type,
            full_name: &full_name,
            token: &token,
            chips: &chips,
        });

        match issued {
            Ok(report) => {
                self.upsert(&document, step, true, |_, _| Ok(()))?;
                Ok(report)
            }
            // Issuer errors are raised before any certificate leaves the engine.
            Err(error) => self.upsert(&document, step, false, |session, _| {
                session.issue_claimed_at = None;
                Err(error.clone())
            }),
        }
    }

    /// Audit trail for a document. Not guarded by the session state.
    pub fn certificate_history(
        &self,
        document: &str,
    ) -> Result<Vec<CertificateRecord>, WorkflowError> {
        let document = normalize_document(document)?;
        self.deps
            .certificates
            .list_for_document(&document)
            .map_err(WorkflowError::Store)
    }

    pub fn session_status(&self, document: &str) -> Result<SessionStatus, WorkflowError> {
        let document = normalize_document(document)?;
        let now = self.deps.clock.now();
        let idle = self.policy.session_idle();
        match self.load(&document)? {
            Some(session) if !session.is_expired(now, idle) => Ok(session.status(now, idle)),
            Some(_) => {
                self.discard(&document, "idle_expired")?;
                Ok(inactive_status())
            }
            None => Ok(inactive_status()),
        }
    }

    /// Drops whatever session exists so the next step starts from consent.
    pub fn restart(&self, document: &str) -> Result<StepReport, WorkflowError> {
        let document = normalize_document(document)?;
        self.discard(&document, "restart_requested")?;
        Ok(StepReport {
            state: WorkflowState::Start,
            message: "session restarted; consent is required to continue".to_string(),
        })
    }

    fn issuer(&self) -> CertificateIssuer<'_> {
        CertificateIssuer {
            ledger: self.deps.quota,
            store: self.deps.certificates,
            service: self.deps.dispatcher,
            clock: self.deps.clock,
            daily_limit: self.policy.daily_certificate_quota,
            day_offset: self.policy.quota_offset(),
        }
    }

    fn call<T>(
        &self,
        step: Step,
        collaborator: Collaborator,
        mut operation: impl FnMut() -> Result<T, CollaboratorError>,
    ) -> Result<T, WorkflowError> {
        retry_upstream(&self.policy.upstream_retry, self.deps.clock, || {
            operation().map_err(|error| WorkflowError::from_collaborator(step, collaborator, error))
        })
    }

    fn load(&self, document: &str) -> Result<Option<Session>, WorkflowError> {
        self.deps
            .sessions
            .get(document)
            .map_err(WorkflowError::Store)
    }

    fn discard(&self, document: &str, reason: &'static str) -> Result<(), WorkflowError> {
        self.deps
            .sessions
            .delete(document)
            .map_err(WorkflowError::Store)?;
        tracing::info!(
            component = "workflow",
            event = "session_discarded",
            document = %masked_document(document),
            fingerprint = %document_fingerprint(document),
            reason,
        );
        Ok(())
    }

    /// A live session whose state admits `step`. Idle sessions are discarded.
    fn snapshot(&self, document: &str, step: Step) -> Result<Session, WorkflowError> {
        let now = self.deps.clock.now();
        match self.load(document)? {
            None => Err(WorkflowError::SequenceViolation {
                current: WorkflowState::Start,
                requested: step,
            }),
            Some(session) if session.is_expired(now, self.policy.session_idle()) => {
                self.discard(document, "idle_expired")?;
                Err(WorkflowError::SessionExpired)
            }
            Some(session) => {
                guard(session.state, step)?;
                Ok(session)
            }
        }
    }

    fn require_token(&self, session: &Session) -> Result<String, WorkflowError> {
        match session.bearer_token(self.deps.clock.now()) {
            Some(token) => Ok(token.to_string()),
            None => {
                self.discard(&session.document, "auth_token_expired")?;
                Err(WorkflowError::SessionExpired)
            }
        }
    }

    /// Records `error` on the session without moving it.
    fn fail<T>(&self, document: &str, step: Step, error: WorkflowError) -> Result<T, WorkflowError> {
        self.upsert(document, step, false, |_, _| Err(error.clone()))
    }

    /// Versioned read-modify-write of one session.
    ///
    /// `apply` may run more than once when a concurrent writer wins. Its error
    /// is persisted as `last_error` with any mutation it made, except errors
    /// that discard the session. With `advance`, success moves the session to
    /// the step's target state.
    fn upsert<T>(
        &self,
        document: &str,
        step: Step,
        advance: bool,
        mut apply: impl FnMut(&mut Session, DateTime<Utc>) -> Result<T, WorkflowError>,
    ) -> Result<T, WorkflowError> {
        for _ in 0..=self.policy.store_conflict_retries {
            let mut session = self.snapshot(document, step)?;
            let now = self.deps.clock.now();
            let expected_version = session.version;
            let target = guard(session.state, step)?;

            let result = apply(&mut session, now);
            match &result {
                Ok(_) => {
                    session.last_error = None;
                    if advance {
                        session.state = target;
                    }
                }
                Err(error) if error.discards_session() => {
                    self.discard(document, error.error_code())?;
                    log_failure(document, step, error);
                    return result;
                }
                Err(error) => session.last_error = Some(error.to_string()),
            }
            session.version = expected_version + 1;
            session.updated_at = now;

            match self
                .deps
                .sessions
                .put(&session, Some(expected_version))
                .map_err(WorkflowError::Store)?
            {
                PutOutcome::Written => {
                    match &result {
                        Ok(_) => log_step(&session, step),
                        Err(error) => log_failure(document, step, error),
                    }
                    return result;
                }
                PutOutcome::Conflict => log_conflict(document, step),
            }
        }

        Err(self.conflicts_exhausted(document))
    }

    fn conflicts_exhausted(&self, document: &str) -> WorkflowError {
        WorkflowError::Store(format!(
            "session {} kept changing after {} write attempts",
            masked_document(document),
            self.policy.store_conflict_retries + 1
        ))
    }
}

fn identity_record(verdict: &IdentityVerdict, now: DateTime<Utc>) -> IdentityRecord {
    IdentityRecord {
        name: verdict.name.clone(),
        email: verdict.email.clone(),
        masked_email: verdict
            .masked_email
            .clone()
            .or_else(|| verdict.email.as_deref().map(mask_email)),
        verified_at: now,
    }
}

fn expect_branch(session: &Session, step: Step, wanted: PropertyBranch) -> Result<(), WorkflowError> {
    match session.branch {
        Some(branch) if branch == wanted => Ok(()),
        Some(PropertyBranch::NoProperties) => Err(WorkflowError::validation(
            step,
            "no properties are registered for this document",
        )),
        Some(PropertyBranch::SearchOnly) => Err(WorkflowError::validation(
            step,
            "too many properties to list; search by CHIP code, address or registration number",
        )),
        Some(PropertyBranch::Listing) => Err(WorkflowError::validation(
            step,
            "few enough properties to list them; use the listing instead of searching",
        )),
        None => Err(WorkflowError::validation(
            step,
            "properties have not been counted yet",
        )),
    }
}

fn inactive_status() -> SessionStatus {
    SessionStatus {
        active: false,
        state: WorkflowState::Start,
        attempts_remaining: None,
        selected: Vec::new(),
        expires_at: None,
        last_error: None,
    }
}

fn log_step(session: &Session, step: Step) {
    tracing::info!(
        component = "workflow",
        event = "step_completed",
        step = %step,
        state = %session.state,
        document = %masked_document(&session.document),
        version = session.version,
    );
}

fn log_failure(document: &str, step: Step, error: &WorkflowError) {
    tracing::warn!(
        component = "workflow",
        event = "step_failed",
        step = %step,
        error_code = error.error_code(),
        document = %masked_document(document),
        error = %error,
    );
}

fn log_conflict(document: &str, step: Step) {
    tracing::debug!(
        component = "workflow",
        event = "session_write_conflict",
        step = %step,
        document = %masked_document(document),
    );
}
