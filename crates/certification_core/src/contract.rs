use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::WorkflowError;
use crate::property::{PropertyBranch, PropertyRecord};
use crate::state::WorkflowState;

pub const SESSION_RECORD_SCHEMA_VERSION: &str = "v1";
pub const MAX_DOCUMENT_LENGTH: usize = 20;

/// Identity document kinds accepted by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Cédula de ciudadanía.
    #[default]
    CC,
    /// Cédula de extranjería.
    CE,
    NIT,
    /// Passport.
    PAS,
    /// Tarjeta de identidad.
    TI,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CC => "CC",
            Self::CE => "CE",
            Self::NIT => "NIT",
            Self::PAS => "PAS",
            Self::TI => "TI",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CC" => Ok(Self::CC),
            "CE" => Ok(Self::CE),
            "NIT" => Ok(Self::NIT),
            "PAS" | "PASAPORTE" => Ok(Self::PAS),
            "TI" => Ok(Self::TI),
            other => Err(WorkflowError::InvalidInput(format!(
                "unsupported document type '{other}'; expected one of CC, CE, NIT, PAS, TI"
            ))),
        }
    }
}

/// Trims and checks a citizen document number.
pub fn normalize_document(raw: &str) -> Result<String, WorkflowError> {
    let document = raw.trim();
    if document.is_empty() {
        return Err(WorkflowError::InvalidInput(
            "document number is required".to_string(),
        ));
    }
    if document.len() > MAX_DOCUMENT_LENGTH {
        return Err(WorkflowError::InvalidInput(format!(
            "document number exceeds {MAX_DOCUMENT_LENGTH} characters"
        )));
    }
    if !document.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(WorkflowError::InvalidInput(
            "document number must contain only letters and digits".to_string(),
        ));
    }
    Ok(document.to_string())
}

/// Log-safe rendering of a document number: first three characters only.
pub fn masked_document(document: &str) -> String {
    let prefix: String = document.chars().take(3).collect();
    format!("{prefix}***")
}

/// Stable correlation id for a document number that never reveals it.
pub fn document_fingerprint(document: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// `u***@example.com` style rendering of a contact email.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first: String = local.chars().take(1).collect();
            format!("{first}***@{domain}")
        }
        _ => "***".to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    pub state: WorkflowState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityOutcome {
    pub state: WorkflowState,
    pub name: Option<String>,
    pub masked_email: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtpOutcome {
    pub state: WorkflowState,
    pub attempts_remaining: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountOutcome {
    pub state: WorkflowState,
    pub total: u32,
    pub branch: PropertyBranch,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertiesOutcome {
    pub state: WorkflowState,
    pub total: usize,
    pub properties: Vec<PropertyRecord>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionOutcome {
    pub state: WorkflowState,
    pub selected: Vec<String>,
    pub remaining_quota: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub active: bool,
    pub state: WorkflowState,
    pub attempts_remaining: Option<u8>,
    pub selected: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_document_trims_and_rejects_symbols() {
        assert_eq!(normalize_document(" 123 ").as_deref(), Ok("123"));
        assert!(normalize_document("").is_err());
        assert!(normalize_document("12-3").is_err());
        assert!(normalize_document(&"9".repeat(21)).is_err());
    }

    #[test]
    fn document_type_parses_case_insensitively() {
        assert_eq!("cc".parse::<DocumentType>(), Ok(DocumentType::CC));
        assert_eq!(" Pas ".parse::<DocumentType>(), Ok(DocumentType::PAS));
        assert!("XX".parse::<DocumentType>().is_err());
    }

    #[test]
    fn masking_never_reveals_full_values() {
        assert_eq!(masked_document("1234567890"), "123***");
        assert_eq!(mask_email("usuario@ejemplo.com"), "u***@ejemplo.com");
        assert_eq!(mask_email("broken"), "***");
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = document_fingerprint("1234567890");
        let b = document_fingerprint("1234567890");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, document_fingerprint("1234567891"));
    }
}
