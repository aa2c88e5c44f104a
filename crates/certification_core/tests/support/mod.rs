#![allow(dead_code)]

use certification_core::state::WorkflowState;
use certification_core::test_helpers::{sample_chip, TestHarness};

pub const DOCUMENT: &str = "123";

/// First `count` CHIP codes of the synthetic portfolio.
pub fn chips(count: usize) -> Vec<String> {
    (0..count).map(sample_chip).collect()
}

/// Runs a full listing-path session for `selection` properties and returns the
/// number of certificates sent.
pub fn complete_session(harness: &TestHarness, document: &str, selection: usize) -> usize {
    harness.reach_selection_validated(document, &chips(selection));
    let report = harness
        .engine()
        .issue_certificates(document, None)
        .expect("certificates issued");
    assert_eq!(
        harness.state_of(document),
        Some(WorkflowState::CertificatesIssued)
    );
    report.total_sent
}
