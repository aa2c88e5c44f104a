mod support;

use certification_core::contract::DocumentType;
use certification_core::error::WorkflowError;
use certification_core::state::WorkflowState;
use certification_core::test_helpers::TestHarness;
use support::DOCUMENT;

#[test]
fn idle_session_restarts_from_start() {
    let harness = TestHarness::new();
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    harness.clock.advance_secs(601);
    let error = engine
        .count_properties(DOCUMENT)
        .expect_err("session idle too long");
    assert_eq!(error, WorkflowError::SessionExpired);
    assert_eq!(harness.state_of(DOCUMENT), None);

    let status = engine.session_status(DOCUMENT).expect("status");
    assert!(!status.active);
    assert_eq!(status.state, WorkflowState::Start);

    let report = engine
        .accept_consent(DOCUMENT, DocumentType::CC, true)
        .expect("fresh session");
    assert_eq!(report.state, WorkflowState::ConsentGiven);
}

#[test]
fn consent_on_an_idle_session_starts_over_instead_of_resuming() {
    let harness = TestHarness::new();
    harness.reach_identity_validated(DOCUMENT);
    let engine = harness.engine();
    engine.validate_otp(DOCUMENT, "0000").expect_err("wrong code");

    harness.clock.advance_secs(601);
    engine
        .accept_consent(DOCUMENT, DocumentType::CE, true)
        .expect("fresh session");

    let session = harness.sessions.stored(DOCUMENT).expect("session");
    assert_eq!(session.state, WorkflowState::ConsentGiven);
    assert_eq!(session.document_type, DocumentType::CE);
    assert_eq!(session.otp.attempts_remaining, 3);
    assert!(session.identity.is_none());
    assert!(session.last_error.is_none());
}

#[test]
fn exactly_the_idle_window_is_still_live() {
    let harness = TestHarness::new();
    harness.reach_otp_validated(DOCUMENT);

    harness.clock.advance_secs(600);
    let status = harness.engine().session_status(DOCUMENT).expect("status");
    assert!(status.active);
    assert_eq!(status.state, WorkflowState::OtpValidated);
}

#[test]
fn each_step_refreshes_the_idle_window() {
    let harness = TestHarness::new();
    let engine = harness.engine();
    engine
        .accept_consent(DOCUMENT, DocumentType::CC, true)
        .expect("consent");

    harness.clock.advance_secs(500);
    engine.validate_identity(DOCUMENT).expect("identity");
    harness.clock.advance_secs(250);
    engine
        .validate_otp(DOCUMENT, "1234")
        .expect("otp within the refreshed window");
}

#[test]
fn unknown_document_reports_an_inactive_session() {
    let harness = TestHarness::new();
    let status = harness.engine().session_status("987").expect("status");
    assert!(!status.active);
    assert_eq!(status.state, WorkflowState::Start);
    assert_eq!(status.expires_at, None);
}
