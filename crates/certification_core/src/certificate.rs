//! Certificate requests, the dispatch collaborator and the quota-guarded issuer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::contract::{document_fingerprint, DocumentType};
use crate::error::{CollaboratorError, WorkflowError};
use crate::quota::{quota_day, QuotaDecision, QuotaLedger};
use crate::store::CertificateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Pending,
    Sent,
    Failed,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for one certificate generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub request_id: Uuid,
    pub document: String,
    pub document_type: DocumentType,
    pub full_name: String,
    pub chip: String,
    pub status: CertificateStatus,
    /// Upstream filing number ("radicado") once the certificate was sent.
    pub request_number: Option<String>,
    pub failure: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn pending(
        document: impl Into<String>,
        document_type: DocumentType,
        full_name: impl Into<String>,
        chip: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            document: document.into(),
            document_type,
            full_name: full_name.into(),
            chip: chip.into(),
            status: CertificateStatus::Pending,
            request_number: None,
            failure: None,
            requested_at: now,
            updated_at: now,
        }
    }

    pub fn mark_sent(&mut self, request_number: Option<String>, now: DateTime<Utc>) {
        self.status = CertificateStatus::Sent;
        self.request_number = request_number;
        self.failure = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, failure: impl Into<String>, now: DateTime<Utc>) {
        self.status = CertificateStatus::Failed;
        self.failure = Some(failure.into());
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub request_number: Option<String>,
}

/// Generates a certificate for one property and delivers it to the citizen.
pub trait CertificateService {
    fn generate(&self, token: &str, chip: &str) -> Result<DispatchReceipt, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest<'r> {
    pub document: &'r str,
    pub document_type: DocumentType,
    pub full_name: &'r str,
    pub token: &'r str,
    pub chips: &'r [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub certificates: Vec<CertificateRecord>,
    pub total_sent: usize,
    pub total_failed: usize,
}

pub struct CertificateIssuer<'a> {
    pub ledger: &'a dyn QuotaLedger,
    pub store: &'a dyn CertificateStore,
    pub service: &'a dyn CertificateService,
    pub clock: &'a dyn Clock,
    pub daily_limit: u32,
    pub day_offset: chrono::FixedOffset,
}

impl CertificateIssuer<'_> {
    /// Certificates the citizen may still request today.
    pub fn remaining(&self, document: &str) -> Result<u32, WorkflowError> {
        let day = quota_day(self.clock.now(), self.day_offset);
        let used = self
            .ledger
            .used(document, day)
            .map_err(WorkflowError::Store)?;
        Ok(self.daily_limit.saturating_sub(used))
    }

    /// Consumes one unit per property, then dispatches each certificate once.
    /// Failed dispatches keep their quota unit. Errors are only returned before
    /// anything has been dispatched; audit write failures after that point are
    /// logged and the report is still returned.
    pub fn issue(&self, request: IssueRequest<'_>) -> Result<IssueReport, WorkflowError> {
        let now = self.clock.now();
        let day = quota_day(now, self.day_offset);
        let requested = u32::try_from(request.chips.len()).unwrap_or(u32::MAX);
        let fingerprint = document_fingerprint(request.document);

        match self
            .ledger
            .try_consume(request.document, day, requested, self.daily_limit)
            .map_err(WorkflowError::Store)?
        {
            QuotaDecision::Accepted { used } => {
                tracing::info!(
                    component = "certificate_issuer",
                    event = "quota_consumed",
                    document = %fingerprint,
                    day = %day,
                    used,
                    limit = self.daily_limit,
                );
            }
            QuotaDecision::Exceeded { used } => {
                tracing::warn!(
                    component = "certificate_issuer",
                    event = "quota_exceeded",
                    document = %fingerprint,
                    day = %day,
                    used,
                    requested,
                );
                return Err(WorkflowError::QuotaExceeded {
                    used,
                    limit: self.daily_limit,
                    requested,
                });
            }
        }

        let mut certificates = Vec::with_capacity(request.chips.len());
        for chip in request.chips {
            let mut record = CertificateRecord::pending(
                request.document,
                request.document_type,
                request.full_name,
                chip.clone(),
                now,
            );
            if let Err(error) = self.store.insert(&record) {
                log_audit_failure(&fingerprint, chip, "insert", &error);
            }

            match self.service.generate(request.token, chip) {
                Ok(receipt) => record.mark_sent(receipt.request_number, self.clock.now()),
                Err(error) => {
                    tracing::warn!(
                        component = "certificate_issuer",
                        event = "dispatch_failed",
                        document = %fingerprint,
                        chip = %chip,
                        error = %error,
                    );
                    record.mark_failed(error.message(), self.clock.now());
                }
            }
            if let Err(error) = self.store.update(&record) {
                log_audit_failure(&fingerprint, chip, "update", &error);
            }
            certificates.push(record);
        }

        let total_sent = certificates
            .iter()
            .filter(|record| record.status == CertificateStatus::Sent)
            .count();
        let total_failed = certificates.len() - total_sent;
        tracing::info!(
            component = "certificate_issuer",
            event = "certificates_dispatched",
            document = %fingerprint,
            total_sent,
            total_failed,
        );

        Ok(IssueReport {
            certificates,
            total_sent,
            total_failed,
        })
    }
}

fn log_audit_failure(fingerprint: &str, chip: &str, operation: &str, error: &str) {
    tracing::error!(
        component = "certificate_issuer",
        event = "audit_write_failed",
        document = %fingerprint,
        chip = %chip,
        operation,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::*;
    use crate::quota::InMemoryQuotaLedger;
    use crate::store::InMemoryCertificateStore;
    use crate::test_helpers::{FlakyCertificateStore, ManualClock, RecordingCertificateService};

    fn issuer<'a>(
        ledger: &'a InMemoryQuotaLedger,
        store: &'a dyn CertificateStore,
        service: &'a RecordingCertificateService,
        clock: &'a ManualClock,
    ) -> CertificateIssuer<'a> {
        CertificateIssuer {
            ledger,
            store,
            service,
            clock,
            daily_limit: 3,
            day_offset: FixedOffset::west_opt(5 * 3_600).expect("valid offset"),
        }
    }

    fn chips(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn request<'r>(chips: &'r [String]) -> IssueRequest<'r> {
        IssueRequest {
            document: "123",
            document_type: DocumentType::CC,
            full_name: "Ana Pérez",
            token: "jwt",
            chips,
        }
    }

    #[test]
    fn failed_dispatch_still_consumes_quota() {
        let ledger = InMemoryQuotaLedger::new();
        let store = InMemoryCertificateStore::new();
        let service = RecordingCertificateService::failing_for(&["AAA2"]);
        let clock = ManualClock::at_epoch();
        let issuer = issuer(&ledger, &store, &service, &clock);

        let selected = chips(&["AAA1", "AAA2"]);
        let report = issuer.issue(request(&selected)).expect("issue succeeds");

        assert_eq!(report.total_sent, 1);
        assert_eq!(report.total_failed, 1);
        assert_eq!(issuer.remaining("123"), Ok(1));
        let statuses: Vec<_> = store.all().iter().map(|record| record.status).collect();
        assert_eq!(
            statuses,
            vec![CertificateStatus::Sent, CertificateStatus::Failed]
        );
        assert_eq!(service.calls(), vec!["AAA1".to_string(), "AAA2".to_string()]);
    }

    #[test]
    fn request_over_limit_is_rejected_whole() {
        let ledger = InMemoryQuotaLedger::new();
        let store = InMemoryCertificateStore::new();
        let service = RecordingCertificateService::default();
        let clock = ManualClock::at_epoch();
        let issuer = issuer(&ledger, &store, &service, &clock);

        let first = chips(&["AAA1", "AAA2"]);
        issuer.issue(request(&first)).expect("first batch fits");

        let second = chips(&["AAA3", "AAA4"]);
        let error = issuer
            .issue(request(&second))
            .expect_err("second batch exceeds quota");
        assert_eq!(
            error,
            WorkflowError::QuotaExceeded {
                used: 2,
                limit: 3,
                requested: 2,
            }
        );
        assert_eq!(store.all().len(), 2);
        assert_eq!(service.calls().len(), 2);
    }

    #[test]
    fn sent_certificates_carry_request_number() {
        let ledger = InMemoryQuotaLedger::new();
        let store = InMemoryCertificateStore::new();
        let service = RecordingCertificateService::default();
        let clock = ManualClock::at_epoch();
        let issuer = issuer(&ledger, &store, &service, &clock);

        let selected = chips(&["AAA1"]);
        let report = issuer.issue(request(&selected)).expect("issue succeeds");
        assert_eq!(
            report.certificates[0].request_number.as_deref(),
            Some("RAD-AAA1")
        );
    }

    #[test]
    fn audit_update_failure_does_not_abort_dispatched_batch() {
        let ledger = InMemoryQuotaLedger::new();
        let store = FlakyCertificateStore::default();
        store.fail_updates(1);
        let service = RecordingCertificateService::default();
        let clock = ManualClock::at_epoch();
        let issuer = issuer(&ledger, &store, &service, &clock);

        let selected = chips(&["AAA1", "AAA2"]);
        let report = issuer
            .issue(request(&selected))
            .expect("dispatch already happened");

        assert_eq!(report.total_sent, 2);
        assert_eq!(service.calls(), selected);
        assert_eq!(issuer.remaining("123"), Ok(1));
        let statuses: Vec<_> = store.all().iter().map(|record| record.status).collect();
        assert_eq!(
            statuses,
            vec![CertificateStatus::Pending, CertificateStatus::Sent]
        );
    }
}
