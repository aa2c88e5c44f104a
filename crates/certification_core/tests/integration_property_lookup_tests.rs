mod support;

use certification_core::error::{CollaboratorError, WorkflowError};
use certification_core::property::{PropertyBranch, SearchCriteria};
use certification_core::state::{Step, WorkflowState};
use certification_core::test_helpers::{sample_chip, TestHarness};
use support::{chips, DOCUMENT};

#[test]
fn four_properties_take_the_listing_path() {
    let harness = TestHarness::with_portfolio(4);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    let count = engine.count_properties(DOCUMENT).expect("count");
    assert_eq!(count.total, 4);
    assert_eq!(count.branch, PropertyBranch::Listing);

    let listed = engine.list_properties(DOCUMENT).expect("list");
    assert_eq!(listed.total, 4);
    assert_eq!(listed.state, WorkflowState::PropertiesResolved);
    assert_eq!(listed.properties[0].chip, sample_chip(0));
}

#[test]
fn fifteen_properties_force_search_and_listing_guides_there() {
    let harness = TestHarness::with_portfolio(15);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    let count = engine.count_properties(DOCUMENT).expect("count");
    assert_eq!(count.branch, PropertyBranch::SearchOnly);
    assert!(count.message.contains("search"));

    let error = engine
        .list_properties(DOCUMENT)
        .expect_err("too many to list");
    match &error {
        WorkflowError::ValidationFailure { step, reason } => {
            assert_eq!(*step, Step::ListProperties);
            assert!(reason.contains("search by CHIP"));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert!(error.is_retryable());
    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::PropertiesQueried)
    );
    let session = harness.sessions.stored(DOCUMENT).expect("session");
    assert!(session.last_error.is_some());
}

#[test]
fn recounting_without_changes_keeps_the_branch() {
    let harness = TestHarness::with_portfolio(15);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    let first = engine.count_properties(DOCUMENT).expect("first count");
    let second = engine.count_properties(DOCUMENT).expect("second count");
    assert_eq!(first.branch, second.branch);
    assert_eq!(first.total, second.total);
    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::PropertiesQueried)
    );
}

#[test]
fn listing_threshold_is_inclusive() {
    let harness = TestHarness::with_portfolio(10);
    harness.reach_otp_validated(DOCUMENT);
    let count = harness.engine().count_properties(DOCUMENT).expect("count");
    assert_eq!(count.branch, PropertyBranch::Listing);
}

#[test]
fn citizen_without_properties_cannot_go_further() {
    let harness = TestHarness::with_portfolio(0);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    let count = engine.count_properties(DOCUMENT).expect("count");
    assert_eq!(count.branch, PropertyBranch::NoProperties);
    assert!(count.message.contains("no properties"));

    let error = engine
        .list_properties(DOCUMENT)
        .expect_err("nothing to list");
    assert_eq!(error.error_code(), "VALIDATION_FAILURE");
    let error = engine
        .search_properties(
            DOCUMENT,
            &SearchCriteria::Chip {
                chip: sample_chip(0),
            },
        )
        .expect_err("nothing to search");
    assert_eq!(error.error_code(), "VALIDATION_FAILURE");
}

#[test]
fn searches_accumulate_candidates_for_selection() {
    let harness = TestHarness::with_portfolio(15);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();
    engine.count_properties(DOCUMENT).expect("count");

    let by_chip = SearchCriteria::parse("CHIP", "AAA-000000000-3", None).expect("criteria");
    let found = engine
        .search_properties(DOCUMENT, &by_chip)
        .expect("search by chip");
    assert_eq!(found.total, 1);
    assert_eq!(found.properties[0].chip, sample_chip(2));

    let by_registration =
        SearchCriteria::parse("MATRICULA", "050C-0000012", Some("Centro")).expect("criteria");
    let found = engine
        .search_properties(DOCUMENT, &by_registration)
        .expect("search by registration");
    assert_eq!(found.properties[0].chip, sample_chip(11));

    let selected = vec![sample_chip(2), sample_chip(11)];
    let selection = engine
        .select_properties(DOCUMENT, &selected)
        .expect("both searched properties are selectable");
    assert_eq!(selection.selected, selected);
}

#[test]
fn search_without_matches_is_a_validation_failure() {
    let harness = TestHarness::with_portfolio(15);
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();
    engine.count_properties(DOCUMENT).expect("count");

    let error = engine
        .search_properties(
            DOCUMENT,
            &SearchCriteria::Address {
                address: "KR 99 # 99-99".to_string(),
            },
        )
        .expect_err("no match");
    assert!(error.to_string().contains("DIRECCION"));
    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::PropertiesQueried)
    );
}

#[test]
fn selection_must_come_from_resolved_candidates() {
    let harness = TestHarness::new();
    harness.reach_properties_listed(DOCUMENT);
    let engine = harness.engine();

    let error = engine
        .select_properties(DOCUMENT, &["ZZZ999".to_string()])
        .expect_err("unknown property");
    assert!(error.to_string().contains("ZZZ999"));

    let error = engine
        .select_properties(DOCUMENT, &chips(4))
        .expect_err("more than three");
    assert!(error.to_string().contains("at most 3"));

    let error = engine
        .select_properties(DOCUMENT, &[" ".to_string()])
        .expect_err("empty selection");
    assert_eq!(error.error_code(), "INVALID_INPUT");

    assert_eq!(
        harness.state_of(DOCUMENT),
        Some(WorkflowState::PropertiesResolved)
    );
}

#[test]
fn duplicate_and_dashed_ids_collapse_to_one_selection() {
    let harness = TestHarness::new();
    harness.reach_properties_listed(DOCUMENT);

    let dashed = format!("{}-{}", &sample_chip(0)[..3], &sample_chip(0)[3..]);
    let selection = harness
        .engine()
        .select_properties(DOCUMENT, &[sample_chip(0), dashed])
        .expect("selection");
    assert_eq!(selection.selected, vec![sample_chip(0)]);
}

#[test]
fn rejected_bearer_token_expires_the_session() {
    let harness = TestHarness::new();
    harness.reach_otp_validated(DOCUMENT);
    harness
        .registry
        .fail_next(CollaboratorError::Unauthorized("jwt expired".to_string()), 1);

    let error = harness
        .engine()
        .count_properties(DOCUMENT)
        .expect_err("token refused");
    assert_eq!(error, WorkflowError::SessionExpired);
    assert_eq!(harness.state_of(DOCUMENT), None);
}

#[test]
fn registry_calls_carry_the_session_token() {
    let harness = TestHarness::new();
    harness.reach_properties_listed(DOCUMENT);
    assert_eq!(
        harness.registry.tokens(),
        vec!["token-123".to_string(), "token-123".to_string()]
    );
}

#[test]
fn bearer_token_lifetime_bounds_property_lookups() {
    let harness = TestHarness::new();
    harness.reach_otp_validated(DOCUMENT);
    let engine = harness.engine();

    harness.clock.advance_secs(300);
    engine.count_properties(DOCUMENT).expect("token still valid");

    harness.clock.advance_secs(300);
    let error = engine
        .list_properties(DOCUMENT)
        .expect_err("token expired");
    assert_eq!(error, WorkflowError::SessionExpired);
    assert_eq!(harness.state_of(DOCUMENT), None);
}
