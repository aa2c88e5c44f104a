//! Step state machine.
//!
//! ```text
//! Start → ConsentGiven → IdentityValidated → OtpValidated → PropertiesQueried
//!       → PropertiesResolved → SelectionMade → SelectionValidated → CertificatesIssued
//! ```
//!
//! Every step is declared once in [`TRANSITIONS`] with the states it may start
//! from and the state it lands in. Targets never precede their sources, so a
//! session can only stay put (re-entrant steps) or move forward.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Start,
    ConsentGiven,
    IdentityValidated,
    OtpValidated,
    PropertiesQueried,
    PropertiesResolved,
    SelectionMade,
    SelectionValidated,
    CertificatesIssued,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CertificatesIssued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ConsentGiven => "consent_given",
            Self::IdentityValidated => "identity_validated",
            Self::OtpValidated => "otp_validated",
            Self::PropertiesQueried => "properties_queried",
            Self::PropertiesResolved => "properties_resolved",
            Self::SelectionMade => "selection_made",
            Self::SelectionValidated => "selection_validated",
            Self::CertificatesIssued => "certificates_issued",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A citizen-facing action that may move the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AcceptConsent,
    ValidateIdentity,
    ResendOtp,
    ValidateOtp,
    CountProperties,
    ListProperties,
    SearchProperties,
    SelectProperties,
    ValidateSelection,
    IssueCertificates,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcceptConsent => "accept_consent",
            Self::ValidateIdentity => "validate_identity",
            Self::ResendOtp => "resend_otp",
            Self::ValidateOtp => "validate_otp",
            Self::CountProperties => "count_properties",
            Self::ListProperties => "list_properties",
            Self::SearchProperties => "search_properties",
            Self::SelectProperties => "select_properties",
            Self::ValidateSelection => "validate_selection",
            Self::IssueCertificates => "issue_certificates",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub step: Step,
    pub from: &'static [WorkflowState],
    pub to: WorkflowState,
}

pub const TRANSITIONS: &[Transition] = &[
    Transition {
        step: Step::AcceptConsent,
        from: &[WorkflowState::Start],
        to: WorkflowState::ConsentGiven,
    },
    Transition {
        step: Step::ValidateIdentity,
        from: &[WorkflowState::ConsentGiven],
        to: WorkflowState::IdentityValidated,
    },
    Transition {
        step: Step::ResendOtp,
        from: &[WorkflowState::IdentityValidated],
        to: WorkflowState::IdentityValidated,
    },
    Transition {
        step: Step::ValidateOtp,
        from: &[WorkflowState::IdentityValidated],
        to: WorkflowState::OtpValidated,
    },
    Transition {
        step: Step::CountProperties,
        from: &[WorkflowState::OtpValidated, WorkflowState::PropertiesQueried],
        to: WorkflowState::PropertiesQueried,
    },
    Transition {
        step: Step::ListProperties,
        from: &[
            WorkflowState::PropertiesQueried,
            WorkflowState::PropertiesResolved,
        ],
        to: WorkflowState::PropertiesResolved,
    },
    Transition {
        step: Step::SearchProperties,
        from: &[
            WorkflowState::PropertiesQueried,
            WorkflowState::PropertiesResolved,
        ],
        to: WorkflowState::PropertiesResolved,
    },
    Transition {
        step: Step::SelectProperties,
        from: &[WorkflowState::PropertiesResolved, WorkflowState::SelectionMade],
        to: WorkflowState::SelectionMade,
    },
    Transition {
        step: Step::ValidateSelection,
        from: &[WorkflowState::SelectionMade],
        to: WorkflowState::SelectionValidated,
    },
    Transition {
        step: Step::IssueCertificates,
        from: &[WorkflowState::SelectionValidated],
        to: WorkflowState::CertificatesIssued,
    },
];

pub fn transition_for(step: Step) -> &'static Transition {
    TRANSITIONS
        .iter()
        .find(|transition| transition.step == step)
        .unwrap_or_else(|| unreachable!("every step has a transition entry"))
}

/// Returns the state `step` lands in when started from `current`.
pub fn guard(current: WorkflowState, step: Step) -> Result<WorkflowState, WorkflowError> {
    let transition = transition_for(step);
    if transition.from.contains(&current) {
        Ok(transition.to)
    } else {
        Err(WorkflowError::SequenceViolation {
            current,
            requested: step,
        })
    }
}
