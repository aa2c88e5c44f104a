use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::DocumentType;
use crate::error::{CollaboratorError, WorkflowError};

pub const OTP_CODE_LENGTH: usize = 4;

/// Contact data the OTP collaborator returns with a successful login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitizenProfile {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpVerdict {
    Accepted {
        token: String,
        expires_in_secs: Option<u64>,
        profile: Option<CitizenProfile>,
    },
    Rejected {
        message: String,
    },
    Expired {
        message: String,
    },
    /// The collaborator locked the account; no further attempts count.
    Locked {
        message: String,
    },
}

pub trait OtpService {
    /// Sends a fresh code to the citizen's registered contact channel.
    fn issue(&self, document: &str, document_type: DocumentType) -> Result<(), CollaboratorError>;

    fn verify(
        &self,
        document: &str,
        document_type: DocumentType,
        code: &str,
    ) -> Result<OtpVerdict, CollaboratorError>;
}

/// Bearer token handed out after a successful OTP login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Codes are exactly four ASCII digits. A malformed code does not consume an attempt.
pub fn validate_code_format(code: &str) -> Result<&str, WorkflowError> {
    let code = code.trim();
    if code.len() != OTP_CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(WorkflowError::InvalidInput(format!(
            "verification code must be {OTP_CODE_LENGTH} digits"
        )));
    }
    Ok(code)
}
