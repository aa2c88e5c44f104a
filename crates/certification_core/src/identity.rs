use serde::{Deserialize, Serialize};

use crate::contract::DocumentType;
use crate::error::CollaboratorError;

/// Identity collaborator verdict for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityVerdict {
    pub valid: bool,
    pub name: Option<String>,
    pub email: Option<String>,
    pub masked_email: Option<String>,
    pub message: Option<String>,
    /// The identity service already sent a temporary code to the citizen.
    #[serde(default)]
    pub otp_dispatched: bool,
}

impl IdentityVerdict {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            name: None,
            email: None,
            masked_email: None,
            message: Some(message.into()),
            otp_dispatched: false,
        }
    }
}

pub trait IdentityService {
    fn verify(
        &self,
        document: &str,
        document_type: DocumentType,
    ) -> Result<IdentityVerdict, CollaboratorError>;
}
