mod support;

use certification_core::certificate::CertificateStatus;
use certification_core::clock::Clock;
use certification_core::error::WorkflowError;
use certification_core::quota::{quota_day, QuotaLedger};
use certification_core::state::WorkflowState;
use certification_core::test_helpers::{
    sample_chip, RecordingCertificateService, TestHarness, TEST_FULL_NAME,
};
use support::{chips, complete_session, DOCUMENT};

fn used_today(harness: &TestHarness) -> u32 {
    let day = quota_day(harness.clock.now(), harness.policy.quota_offset());
    harness.quota.used(DOCUMENT, day).expect("ledger read")
}

#[test]
fn third_certificate_succeeds_and_fourth_is_refused() {
    let harness = TestHarness::new();
    assert_eq!(complete_session(&harness, DOCUMENT, 2), 2);
    assert_eq!(complete_session(&harness, DOCUMENT, 1), 1);
    assert_eq!(used_today(&harness), 3);

    harness.reach_properties_listed(DOCUMENT);
    let engine = harness.engine();
    engine
        .select_properties(DOCUMENT, &chips(1))
        .expect("selection itself is allowed");
    let error = engine
        .validate_selection(DOCUMENT, true)
        .expect_err("fourth certificate today");

    assert_eq!(
        error,
        WorkflowError::QuotaExceeded {
            used: 3,
            limit: 3,
            requested: 1,
        }
    );
    assert!(!error.is_retryable());
    assert_eq!(harness.state_of(DOCUMENT), Some(WorkflowState::SelectionMade));
    assert_eq!(used_today(&harness), 3);
    assert_eq!(harness.dispatcher.calls().len(), 3);
}

#[test]
fn quota_resets_on_the_next_local_day() {
    let harness = TestHarness::new();
    complete_session(&harness, DOCUMENT, 3);

    // 12:00 UTC is 07:00 in Bogotá; local midnight is 17 hours away.
    harness.clock.advance_secs(16 * 3_600 + 59 * 60);
    harness.reach_properties_listed(DOCUMENT);
    harness
        .engine()
        .select_properties(DOCUMENT, &chips(1))
        .expect("select");
    harness
        .engine()
        .validate_selection(DOCUMENT, true)
        .expect_err("still the same local day");

    harness.clock.advance_secs(60);
    harness.engine().restart(DOCUMENT).expect("restart");
    assert_eq!(complete_session(&harness, DOCUMENT, 1), 1);
    assert_eq!(used_today(&harness), 1);
}

#[test]
fn failed_dispatch_consumes_quota_and_still_finishes() {
    let harness = TestHarness::new()
        .with_dispatcher(RecordingCertificateService::failing_for(&[sample_chip(1).as_str()]));
    harness.reach_selection_validated(DOCUMENT, &chips(2));

    let report = harness
        .engine()
        .issue_certificates(DOCUMENT, Some("Ana María Pérez"))
        .expect("issue attempted for every property");
    assert_eq!(report.total_sent, 1);
    assert_eq!(report.total_failed, 1);
    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::CertificatesIssued)
    );
    assert_eq!(used_today(&harness), 2);

    let failed = report
        .certificates
        .iter()
        .find(|record| record.status == CertificateStatus::Failed)
        .expect("one failure");
    assert_eq!(failed.chip, sample_chip(1));
    assert!(failed.failure.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(failed.full_name, "Ana María Pérez");
}

#[test]
fn quota_taken_between_validation_and_issue_releases_the_claim() {
    let harness = TestHarness::new();
    harness.reach_selection_validated(DOCUMENT, &chips(2));
    let day = quota_day(harness.clock.now(), harness.policy.quota_offset());
    harness
        .quota
        .try_consume(DOCUMENT, day, 2, 3)
        .expect("concurrent consumption");

    let error = harness
        .engine()
        .issue_certificates(DOCUMENT, None)
        .expect_err("quota gone");
    assert!(matches!(error, WorkflowError::QuotaExceeded { used: 2, .. }));
    assert!(harness.dispatcher.calls().is_empty());

    let session = harness.sessions.stored(DOCUMENT).expect("session kept");
    assert_eq!(session.state, WorkflowState::SelectionValidated);
    assert!(session.issue_claimed_at.is_none());
    assert!(session.last_error.is_some());
}

#[test]
fn claimed_session_is_never_dispatched_twice() {
    let harness = TestHarness::new();
    harness.reach_selection_validated(DOCUMENT, &chips(1));
    let mut session = harness.sessions.stored(DOCUMENT).expect("session");
    session.issue_claimed_at = Some(harness.clock.now());
    harness.sessions.overwrite(&session);

    let error = harness
        .engine()
        .issue_certificates(DOCUMENT, None)
        .expect_err("dispatch already claimed");
    assert!(error.to_string().contains("already being issued"));
    assert!(harness.dispatcher.calls().is_empty());
    assert_eq!(used_today(&harness), 0);
}

#[test]
fn audit_write_failure_after_dispatch_keeps_the_claim() {
    let harness = TestHarness::new();
    harness.reach_selection_validated(DOCUMENT, &chips(1));
    harness.certificates.fail_updates(1);

    let report = harness
        .engine()
        .issue_certificates(DOCUMENT, None)
        .expect("certificate already dispatched");
    assert_eq!(report.total_sent, 1);
    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::CertificatesIssued)
    );

    harness
        .engine()
        .issue_certificates(DOCUMENT, None)
        .expect_err("same session cannot dispatch again");
    assert_eq!(harness.dispatcher.calls(), vec![sample_chip(0)]);
    assert_eq!(used_today(&harness), 1);
    let session = harness.sessions.stored(DOCUMENT).expect("session");
    assert!(session.issue_claimed_at.is_some());
}

#[test]
fn history_lists_audit_records_with_request_numbers() {
    let harness = TestHarness::new();
    complete_session(&harness, DOCUMENT, 2);

    let history = harness
        .engine()
        .certificate_history(DOCUMENT)
        .expect("history");
    assert_eq!(history.len(), 2);
    for record in &history {
        assert_eq!(record.status, CertificateStatus::Sent);
        assert_eq!(record.full_name, TEST_FULL_NAME);
        assert_eq!(
            record.request_number.as_deref(),
            Some(format!("RAD-{}", record.chip).as_str())
        );
    }
    assert!(harness
        .engine()
        .certificate_history("999")
        .expect("history")
        .is_empty());
}

#[test]
fn unconfirmed_selection_stays_selectable() {
    let harness = TestHarness::new();
    harness.reach_properties_listed(DOCUMENT);
    let engine = harness.engine();
    engine
        .select_properties(DOCUMENT, &chips(2))
        .expect("select");

    let error = engine
        .validate_selection(DOCUMENT, false)
        .expect_err("not confirmed");
    assert_eq!(error.error_code(), "VALIDATION_FAILURE");
    engine
        .select_properties(DOCUMENT, &chips(1))
        .expect("reselect after declining");
    let confirmed = engine
        .validate_selection(DOCUMENT, true)
        .expect("confirm");
    assert_eq!(confirmed.remaining_quota, Some(3));
}
