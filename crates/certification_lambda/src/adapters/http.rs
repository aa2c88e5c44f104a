//! HTTP clients for the identity, OTP, registry and certificate collaborators.
//!
//! Requests are sent with the async `reqwest` client and bridged into the
//! synchronous collaborator traits with `block_in_place`, so these adapters must
//! run on a multi-threaded Tokio runtime. Response interpretation lives in
//! plain functions so it can be tested without a network.

use std::time::Duration;

use certification_core::certificate::{CertificateService, DispatchReceipt};
use certification_core::contract::{mask_email, DocumentType};
use certification_core::error::CollaboratorError;
use certification_core::identity::{IdentityService, IdentityVerdict};
use certification_core::otp::{CitizenProfile, OtpService, OtpVerdict};
use certification_core::property::{PropertyRecord, PropertyRegistry, SearchCriteria};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// `None` when the body was empty or not JSON.
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
}

impl ApiClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build http client: {error}"))?;
        Ok(Self { http })
    }

    pub fn get(&self, url: &str, token: &str) -> Result<ApiResponse, CollaboratorError> {
        self.execute(
            self.http
                .get(url)
                .bearer_auth(token)
                .header("Accept", "application/json"),
        )
    }

    pub fn post_json(&self, url: &str, body: &Value) -> Result<ApiResponse, CollaboratorError> {
        self.execute(self.http.post(url).json(body))
    }

    fn execute(&self, request: RequestBuilder) -> Result<ApiResponse, CollaboratorError> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let response = request.send().await.map_err(|error| {
                    if error.is_timeout() {
                        CollaboratorError::Unavailable("request timed out".to_string())
                    } else {
                        CollaboratorError::Unavailable(format!("request failed: {error}"))
                    }
                })?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await.map_err(|error| {
                    CollaboratorError::Unavailable(format!("failed to read response body: {error}"))
                })?;
                let body = if bytes.is_empty() {
                    None
                } else {
                    serde_json::from_slice(&bytes).ok()
                };
                tracing::debug!(
                    component = "http_adapter",
                    event = "response_received",
                    status,
                    bytes = bytes.len(),
                );
                Ok::<_, CollaboratorError>(ApiResponse { status, body })
            })
        })
    }
}

fn body_message(body: Option<&Value>) -> Option<String> {
    let body = body?;
    ["message", "mensaje", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Maps a non-success status onto the collaborator failure taxonomy.
pub fn classify_status(response: &ApiResponse) -> Result<(), CollaboratorError> {
    let message =
        || body_message(response.body.as_ref()).unwrap_or_else(|| format!("HTTP {}", response.status));
    match response.status {
        200..=299 => Ok(()),
        400 => Err(CollaboratorError::InvalidInput(message())),
        401 | 403 => Err(CollaboratorError::Unauthorized(message())),
        404 => Err(CollaboratorError::NotFound(message())),
        405 | 406 | 409 | 422 => Err(CollaboratorError::Rejected(message())),
        _ => Err(CollaboratorError::Unavailable(message())),
    }
}

/// Successful JSON body, or `Unavailable` when there is nothing to read.
fn success_body(response: ApiResponse) -> Result<Value, CollaboratorError> {
    classify_status(&response)?;
    response.body.ok_or_else(|| {
        CollaboratorError::Unavailable("empty or invalid JSON response".to_string())
    })
}

fn data_of(body: &Value) -> &Value {
    body.get("data").unwrap_or(body)
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub fn parse_count(body: &Value) -> Result<u32, CollaboratorError> {
    let data = data_of(body);
    let number = data.as_u64().or_else(|| {
        ["total", "count", "totalPredios"]
            .iter()
            .find_map(|key| data.get(*key).or_else(|| body.get(*key)).and_then(Value::as_u64))
    });
    number
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| {
            CollaboratorError::Unavailable("property count missing from response".to_string())
        })
}

pub fn parse_properties(body: &Value) -> Result<Vec<PropertyRecord>, CollaboratorError> {
    let data = data_of(body);
    let items = match data {
        Value::Array(items) => items.clone(),
        Value::Object(object) => match ["predios", "items", "content"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_array))
        {
            Some(items) => items.clone(),
            None if object.contains_key("chip") => vec![data.clone()],
            None => Vec::new(),
        },
        Value::Null => Vec::new(),
        _ => {
            return Err(CollaboratorError::Unavailable(
                "property list has an unexpected shape".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<PropertyRecord>(item).map_err(|error| {
                CollaboratorError::Unavailable(format!("invalid property record: {error}"))
            })
        })
        .collect()
}

pub fn parse_identity(body: &Value, sends_otp: bool) -> IdentityVerdict {
    let data = data_of(body);
    let valid = ["valido", "valid", "success"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_bool))
        .unwrap_or(true);
    let email = string_field(data, &["correo", "email"]);
    let masked_email = string_field(data, &["correo_ofuscado", "correoOfuscado", "maskedEmail"])
        .or_else(|| email.as_deref().map(mask_email));
    let name = string_field(data, &["nombre", "nombreCompleto", "name"]).map(|first| {
        match string_field(data, &["apellido"]) {
            Some(last) => format!("{first} {last}"),
            None => first,
        }
    });

    IdentityVerdict {
        valid,
        name,
        email,
        masked_email,
        message: body_message(Some(body)),
        otp_dispatched: valid && sends_otp,
    }
}

/// Interprets the `/auth/login` answer to a temporary key.
pub fn parse_login(response: ApiResponse) -> Result<OtpVerdict, CollaboratorError> {
    let message = body_message(response.body.as_ref())
        .unwrap_or_else(|| "incorrect verification code".to_string());
    let lowered = message.to_lowercase();
    let expired = lowered.contains("expir");
    let locked = lowered.contains("bloque") || lowered.contains("agotado") || lowered.contains("locked");

    match response.status {
        200..=299 => {}
        400 | 401 if expired => return Ok(OtpVerdict::Expired { message }),
        400 | 401 => return Ok(OtpVerdict::Rejected { message }),
        403 | 423 => return Ok(OtpVerdict::Locked { message }),
        _ => classify_status(&response)?,
    }

    let body = response.body.ok_or_else(|| {
        CollaboratorError::Unavailable("empty or invalid JSON response".to_string())
    })?;
    let succeeded = body.get("success").and_then(Value::as_bool).unwrap_or(false);
    if !succeeded {
        return Ok(if locked {
            OtpVerdict::Locked { message }
        } else if expired {
            OtpVerdict::Expired { message }
        } else {
            OtpVerdict::Rejected { message }
        });
    }

    let data = data_of(&body);
    let token = string_field(data, &["token"]).ok_or_else(|| {
        CollaboratorError::Unavailable("login response carried no token".to_string())
    })?;
    let user = data.get("usuario").unwrap_or(&Value::Null);
    let name = string_field(user, &["nombre"]).map(|first| match string_field(user, &["apellido"]) {
        Some(last) => format!("{first} {last}"),
        None => first,
    });

    Ok(OtpVerdict::Accepted {
        token,
        expires_in_secs: data.get("expiresIn").and_then(Value::as_u64),
        profile: Some(CitizenProfile {
            name,
            email: string_field(user, &["email", "correo"]),
        }),
    })
}

pub fn parse_receipt(body: &Value) -> Result<DispatchReceipt, CollaboratorError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(CollaboratorError::Rejected(
            body_message(Some(body)).unwrap_or_else(|| "certificate was not generated".to_string()),
        ));
    }
    Ok(DispatchReceipt {
        request_number: string_field(data_of(body), &["requestNumber", "numeroRadicado"]),
    })
}

pub fn search_path(criteria: &SearchCriteria) -> String {
    match criteria {
        SearchCriteria::Chip { chip } => format!("/properties/chip/{}", urlencoding::encode(chip)),
        SearchCriteria::Address { address } => {
            format!("/properties/address/{}", urlencoding::encode(address))
        }
        SearchCriteria::Registration { zone, number } => format!(
            "/properties/matricula/{}/{}",
            zone.as_str(),
            urlencoding::encode(number)
        ),
    }
}

fn identity_payload(document: &str, document_type: DocumentType) -> Value {
    json!({
        "tipoDocumento": document_type.as_str(),
        "numeroDocumento": document,
        "validInput": true,
    })
}

pub struct HttpIdentityService {
    pub client: ApiClient,
    pub url: String,
    pub sends_otp: bool,
}

impl IdentityService for HttpIdentityService {
    fn verify(
        &self,
        document: &str,
        document_type: DocumentType,
    ) -> Result<IdentityVerdict, CollaboratorError> {
        let response = self
            .client
            .post_json(&self.url, &identity_payload(document, document_type))?;
        if response.status == 404 {
            return Ok(IdentityVerdict::rejected(
                body_message(response.body.as_ref())
                    .unwrap_or_else(|| "document is not registered".to_string()),
            ));
        }
        let body = success_body(response)?;
        Ok(parse_identity(&body, self.sends_otp))
    }
}

/// Issues codes through the identity temporary-key endpoint and verifies them
/// by logging in with the key.
pub struct HttpOtpService {
    pub client: ApiClient,
    pub issue_url: String,
    pub login_url: String,
}

impl OtpService for HttpOtpService {
    fn issue(&self, document: &str, document_type: DocumentType) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post_json(&self.issue_url, &identity_payload(document, document_type))?;
        classify_status(&response)
    }

    fn verify(
        &self,
        document: &str,
        document_type: DocumentType,
        code: &str,
    ) -> Result<OtpVerdict, CollaboratorError> {
        let payload = json!({
            "tipoDocumento": document_type.as_str(),
            "numeroDocumento": document,
            "claveTemporal": code,
            "validInput": true,
        });
        parse_login(self.client.post_json(&self.login_url, &payload)?)
    }
}

pub struct HttpPropertyRegistry {
    pub client: ApiClient,
    pub base_url: String,
}

impl PropertyRegistry for HttpPropertyRegistry {
    fn count(&self, token: &str) -> Result<u32, CollaboratorError> {
        let url = format!("{}/properties/count", self.base_url);
        parse_count(&success_body(self.client.get(&url, token)?)?)
    }

    fn list(&self, token: &str) -> Result<Vec<PropertyRecord>, CollaboratorError> {
        let url = format!("{}/properties", self.base_url);
        parse_properties(&success_body(self.client.get(&url, token)?)?)
    }

    fn search(
        &self,
        token: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<PropertyRecord>, CollaboratorError> {
        let url = format!("{}{}", self.base_url, search_path(criteria));
        match self.client.get(&url, token)? {
            ApiResponse { status: 404, .. } => Ok(Vec::new()),
            response => parse_properties(&success_body(response)?),
        }
    }
}

pub struct HttpCertificateService {
    pub client: ApiClient,
    pub base_url: String,
}

impl CertificateService for HttpCertificateService {
    fn generate(&self, token: &str, chip: &str) -> Result<DispatchReceipt, CollaboratorError> {
        let url = format!(
            "{}/reports/certification/property/{}",
            self.base_url,
            urlencoding::encode(chip)
        );
        parse_receipt(&success_body(self.client.get(&url, token)?)?)
    }
}
