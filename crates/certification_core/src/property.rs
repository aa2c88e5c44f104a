//! Property registry contract and search criteria normalization.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CollaboratorError, WorkflowError};

/// Which resolution path a citizen is on after the count step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyBranch {
    NoProperties,
    Listing,
    SearchOnly,
}

pub fn branch_for_count(count: u32, listing_threshold: u32) -> PropertyBranch {
    match count {
        0 => PropertyBranch::NoProperties,
        n if n <= listing_threshold => PropertyBranch::Listing,
        _ => PropertyBranch::SearchOnly,
    }
}

/// A property as returned by the registry. Fields the workflow does not
/// interpret are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyRecord {
    pub chip: String,
    #[serde(default, alias = "direccion", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, alias = "matricula", skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl PropertyRecord {
    pub fn new(chip: impl Into<String>) -> Self {
        Self {
            chip: chip.into(),
            address: None,
            registration: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn normalized_chip(&self) -> String {
        normalize_chip(&self.chip)
    }
}

/// Registry circle ("círculo registral") a registration number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryZone {
    Norte,
    Centro,
    Sur,
}

impl RegistryZone {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Norte => "NORTE",
            Self::Centro => "CENTRO",
            Self::Sur => "SUR",
        }
    }

    pub fn circle_code(self) -> &'static str {
        match self {
            Self::Norte => "050N",
            Self::Centro => "050C",
            Self::Sur => "050S",
        }
    }
}

impl fmt::Display for RegistryZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryZone {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NORTE" => Ok(Self::Norte),
            "CENTRO" => Ok(Self::Centro),
            "SUR" => Ok(Self::Sur),
            _ => Err(WorkflowError::InvalidInput(
                "zone must be one of Norte, Centro or Sur".to_string(),
            )),
        }
    }
}

/// A discriminating query for citizens with too many properties to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SearchCriteria {
    Chip { chip: String },
    Address { address: String },
    Registration { zone: RegistryZone, number: String },
}

impl SearchCriteria {
    /// Builds criteria from the agent's `metodo`/`valor`/`zona` parameters.
    pub fn parse(method: &str, value: &str, zone: Option<&str>) -> Result<Self, WorkflowError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(WorkflowError::InvalidInput(
                "search value is required".to_string(),
            ));
        }

        match method.trim().to_ascii_uppercase().as_str() {
            "CHIP" => {
                let chip = normalize_chip(value);
                if chip.is_empty() {
                    return Err(WorkflowError::InvalidInput(
                        "CHIP code is empty after normalization".to_string(),
                    ));
                }
                Ok(Self::Chip { chip })
            }
            "DIRECCION" | "ADDRESS" => Ok(Self::Address {
                address: value.to_string(),
            }),
            "MATRICULA" | "REGISTRATION" => {
                let zone = zone
                    .filter(|zone| !zone.trim().is_empty())
                    .ok_or_else(|| {
                        WorkflowError::InvalidInput(
                            "zone is required to search by registration number (Norte, Centro, Sur)"
                                .to_string(),
                        )
                    })?
                    .parse::<RegistryZone>()?;
                let number = normalize_registration(value);
                if number.is_empty() {
                    return Err(WorkflowError::InvalidInput(
                        "registration number is empty after normalization".to_string(),
                    ));
                }
                Ok(Self::Registration { zone, number })
            }
            other => Err(WorkflowError::InvalidInput(format!(
                "unsupported search method '{other}'; expected one of CHIP, DIRECCION, MATRICULA"
            ))),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Chip { .. } => "CHIP",
            Self::Address { .. } => "DIRECCION",
            Self::Registration { .. } => "MATRICULA",
        }
    }
}

/// CHIP codes are compared without dashes or surrounding whitespace.
pub fn normalize_chip(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Strips any circle prefix (`050C`, `050N`, `050S`) and dashes.
pub fn normalize_registration(raw: &str) -> String {
    let mut number = raw.trim();
    for zone in [RegistryZone::Centro, RegistryZone::Norte, RegistryZone::Sur] {
        if let Some(rest) = number.strip_prefix(zone.circle_code()) {
            number = rest;
            break;
        }
    }
    number.chars().filter(|c| *c != '-').collect()
}

pub trait PropertyRegistry {
    fn count(&self, token: &str) -> Result<u32, CollaboratorError>;
    fn list(&self, token: &str) -> Result<Vec<PropertyRecord>, CollaboratorError>;
    /// An empty result means nothing matched.
    fn search(
        &self,
        token: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<PropertyRecord>, CollaboratorError>;
}
