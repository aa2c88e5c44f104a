use std::fmt;

use crate::state::{Step, WorkflowState};

/// External system a step depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Identity,
    Otp,
    PropertyRegistry,
    CertificateService,
}

impl Collaborator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity_service",
            Self::Otp => "otp_service",
            Self::PropertyRegistry => "property_registry",
            Self::CertificateService => "certificate_service",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by an adapter when an external call does not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator refused the request shape.
    InvalidInput(String),
    /// Timeout, connection failure, 5xx, or an unreadable response.
    Unavailable(String),
    /// The collaborator answered and said no.
    Rejected(String),
    /// The bearer token was refused.
    Unauthorized(String),
    NotFound(String),
}

impl CollaboratorError {
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidInput(message)
            | Self::Unavailable(message)
            | Self::Rejected(message)
            | Self::Unauthorized(message)
            | Self::NotFound(message) => message,
        }
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for CollaboratorError {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step `{requested}` is not allowed while the session is in `{current}`; restart required")]
    SequenceViolation {
        current: WorkflowState,
        requested: Step,
    },

    #[error("{step} validation failed: {reason}")]
    ValidationFailure { step: Step, reason: String },

    #[error("{step} rejected: {reason}")]
    Rejected { step: Step, reason: String },

    #[error("verification attempts exhausted; restart required")]
    AttemptsExhausted,

    #[error("{collaborator} unavailable: {reason}")]
    UpstreamUnavailable {
        collaborator: Collaborator,
        reason: String,
    },

    #[error("daily certificate quota reached: {used} of {limit} used, {requested} requested")]
    QuotaExceeded { used: u32, limit: u32, requested: u32 },

    #[error("session expired; the workflow restarts from the beginning")]
    SessionExpired,

    #[error("session store failure: {0}")]
    Store(String),
}

impl WorkflowError {
    pub fn validation(step: Step, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            step,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code surfaced to the driving layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SequenceViolation { .. } => "SEQUENCE_VIOLATION",
            Self::ValidationFailure { .. } => "VALIDATION_FAILURE",
            Self::Rejected { .. } => "REJECTED",
            Self::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::SessionExpired => 401,
            Self::AttemptsExhausted => 403,
            Self::SequenceViolation { .. } => 409,
            Self::ValidationFailure { .. } | Self::Rejected { .. } => 422,
            Self::QuotaExceeded { .. } => 429,
            Self::Store(_) => 500,
            Self::UpstreamUnavailable { .. } => 502,
        }
    }

    /// Whether the citizen may retry the current step.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::SequenceViolation { .. } | Self::QuotaExceeded { .. } | Self::AttemptsExhausted
        )
    }

    /// Errors after which the stored session must not be kept.
    pub fn discards_session(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::AttemptsExhausted)
    }

    pub(crate) fn from_collaborator(
        step: Step,
        collaborator: Collaborator,
        error: CollaboratorError,
    ) -> Self {
        match error {
            CollaboratorError::InvalidInput(message) => Self::InvalidInput(message),
            CollaboratorError::Unavailable(reason) => Self::UpstreamUnavailable {
                collaborator,
                reason,
            },
            CollaboratorError::Rejected(reason) => Self::Rejected { step, reason },
            CollaboratorError::NotFound(reason) => Self::ValidationFailure { step, reason },
            CollaboratorError::Unauthorized(_) => Self::SessionExpired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sequence_and_quota_and_exhaustion_are_terminal() {
        assert!(!WorkflowError::SequenceViolation {
            current: WorkflowState::Start,
            requested: Step::ValidateOtp,
        }
        .is_retryable());
        assert!(!WorkflowError::QuotaExceeded {
            used: 3,
            limit: 3,
            requested: 1,
        }
        .is_retryable());
        assert!(WorkflowError::validation(Step::ValidateOtp, "wrong code").is_retryable());
        assert!(WorkflowError::SessionExpired.is_retryable());
        assert!(WorkflowError::UpstreamUnavailable {
            collaborator: Collaborator::Otp,
            reason: "timeout".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn http_statuses_follow_error_kind() {
        assert_eq!(WorkflowError::InvalidInput("x".to_string()).http_status(), 400);
        assert_eq!(WorkflowError::SessionExpired.http_status(), 401);
        assert_eq!(
            WorkflowError::SequenceViolation {
                current: WorkflowState::Start,
                requested: Step::CountProperties,
            }
            .http_status(),
            409
        );
        assert_eq!(
            WorkflowError::QuotaExceeded {
                used: 3,
                limit: 3,
                requested: 1,
            }
            .http_status(),
            429
        );
    }

    #[test]
    fn unauthorized_collaborator_maps_to_session_expiry() {
        let error = WorkflowError::from_collaborator(
            Step::CountProperties,
            Collaborator::PropertyRegistry,
            CollaboratorError::Unauthorized("token expired".to_string()),
        );
        assert_eq!(error, WorkflowError::SessionExpired);
        assert!(error.discards_session());
    }
}
