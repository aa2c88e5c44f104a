//! Agent action-group handler: decodes the invocation, runs one workflow step
//! and wraps the outcome in the response envelope the agent expects.

use std::str::FromStr;

use certification_core::contract::{masked_document, DocumentType};
use certification_core::error::WorkflowError;
use certification_core::otp::OTP_CODE_LENGTH;
use certification_core::property::SearchCriteria;
use certification_core::workflow::WorkflowEngine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const MESSAGE_VERSION: &str = "1.0";
const JSON_CONTENT_TYPE: &str = "application/json";
const UNKNOWN_ACTION_CODE: &str = "UNKNOWN_ACTION";

/// Event keys that describe the invocation rather than carry a parameter.
const INVOCATION_KEYS: &[&str] = &[
    "messageVersion",
    "agent",
    "actionGroup",
    "apiPath",
    "httpMethod",
    "sessionId",
    "inputText",
    "parameters",
    "requestBody",
    "sessionAttributes",
    "promptSessionAttributes",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action_group: String,
    pub api_path: String,
    pub http_method: String,
    pub session_id: Option<String>,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionBody {
    pub success: bool,
    pub message: String,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub retryable: bool,
    #[serde(default)]
    pub data: Value,
}

impl ActionBody {
    fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_code: None,
            retryable: false,
            data,
        }
    }

    fn from_error(error: &WorkflowError) -> Self {
        let data = match error {
            WorkflowError::QuotaExceeded {
                used,
                limit,
                requested,
            } => json!({"used": used, "limit": limit, "requested": requested}),
            WorkflowError::SessionExpired | WorkflowError::AttemptsExhausted => {
                json!({"restartRequired": true})
            }
            WorkflowError::SequenceViolation { current, .. } => {
                json!({"currentState": current, "restartRequired": true})
            }
            _ => Value::Null,
        };
        Self {
            success: false,
            message: error.to_string(),
            error_code: Some(error.error_code().to_string()),
            retryable: error.is_retryable(),
            data,
        }
    }
}

/// Reads an action invocation, or a flat JSON object carrying `apiPath`.
pub fn decode_event(event: &Value) -> Result<ActionRequest, String> {
    let Some(object) = event.as_object() else {
        return Err("agent event must be a JSON object".to_string());
    };
    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
    let api_path = text("apiPath")
        .filter(|path| !path.trim().is_empty())
        .ok_or_else(|| "agent event must include apiPath".to_string())?;

    let mut parameters = Map::new();
    for (key, value) in object {
        if !INVOCATION_KEYS.contains(&key.as_str()) {
            parameters.insert(key.clone(), value.clone());
        }
    }
    if let Some(listed) = object.get("parameters").and_then(Value::as_array) {
        collect_named_values(listed, &mut parameters);
    }
    let body_properties = object
        .get("requestBody")
        .and_then(|body| body.get("content"))
        .and_then(|content| content.get(JSON_CONTENT_TYPE))
        .and_then(|json_body| json_body.get("properties"))
        .and_then(Value::as_array);
    if let Some(properties) = body_properties {
        collect_named_values(properties, &mut parameters);
    }

    Ok(ActionRequest {
        action_group: text("actionGroup").unwrap_or_default(),
        api_path: api_path.trim().to_string(),
        http_method: text("httpMethod").unwrap_or_else(|| "POST".to_string()),
        session_id: text("sessionId"),
        parameters,
    })
}

fn collect_named_values(entries: &[Value], parameters: &mut Map<String, Value>) {
    for entry in entries {
        let name = entry.get("name").and_then(Value::as_str);
        if let (Some(name), Some(value)) = (name, entry.get("value")) {
            parameters.insert(name.to_string(), value.clone());
        }
    }
}

/// Runs the decoded action and builds the agent response envelope.
pub fn handle_agent_event(event: &Value, engine: &WorkflowEngine<'_>) -> Result<Value, String> {
    let request = decode_event(event)?;
    let (status, body) = dispatch(&request, engine);

    tracing::info!(
        component = "agent_handler",
        event = "action_completed",
        api_path = %request.api_path,
        status,
        success = body.success,
        error_code = body.error_code.as_deref().unwrap_or(""),
        document = %parameter_text(&request.parameters, &["documento"])
            .map(|document| masked_document(&document))
            .unwrap_or_default(),
    );

    envelope(&request, status, &body)
}

pub fn envelope(request: &ActionRequest, status: u16, body: &ActionBody) -> Result<Value, String> {
    let body = serde_json::to_string(body)
        .map_err(|error| format!("failed to serialize action body: {error}"))?;
    Ok(json!({
        "messageVersion": MESSAGE_VERSION,
        "response": {
            "actionGroup": request.action_group,
            "apiPath": request.api_path,
            "httpMethod": request.http_method,
            "httpStatusCode": status,
            "responseBody": {
                JSON_CONTENT_TYPE: { "body": body }
            }
        }
    }))
}

pub fn dispatch(request: &ActionRequest, engine: &WorkflowEngine<'_>) -> (u16, ActionBody) {
    match run_action(request, engine) {
        Ok(Some(body)) => (200, body),
        Ok(None) => (
            404,
            ActionBody {
                success: false,
                message: format!("unknown action `{}`", request.api_path),
                error_code: Some(UNKNOWN_ACTION_CODE.to_string()),
                retryable: false,
                data: Value::Null,
            },
        ),
        Err(error) => (error.http_status(), ActionBody::from_error(&error)),
    }
}

fn run_action(
    request: &ActionRequest,
    engine: &WorkflowEngine<'_>,
) -> Result<Option<ActionBody>, WorkflowError> {
    let params = &request.parameters;
    let path = request.api_path.trim_end_matches('/');
    if !is_known_path(path) {
        return Ok(None);
    }
    let document = required_text(params, &["documento", "numeroDocumento"], "documento")?;

    let body = match path {
        "/aceptar-consentimiento" => {
            let document_type = match parameter_text(params, &["tipoDocumento"]) {
                Some(raw) => DocumentType::from_str(&raw)?,
                None => DocumentType::default(),
            };
            let accepted = parameter_flag(params, &["aceptado", "acepta"])?.unwrap_or(false);
            let report = engine.accept_consent(&document, document_type, accepted)?;
            ActionBody::ok(report.message.clone(), to_data(&report))
        }
        "/validar-identidad" => {
            let outcome = engine.validate_identity(&document)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/reenviar-otp" => {
            let outcome = engine.resend_otp(&document)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/validar-otp" => {
            let code = otp_code(params)?;
            let outcome = engine.validate_otp(&document, &code)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/contar-predios" => {
            let outcome = engine.count_properties(&document)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/listar-predios" => {
            let outcome = engine.list_properties(&document)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/buscar-predios" => {
            let method = required_text(params, &["metodo"], "metodo")?;
            let value = required_text(params, &["valor"], "valor")?;
            let zone = parameter_text(params, &["zona"]);
            let criteria = SearchCriteria::parse(&method, &value, zone.as_deref())?;
            let outcome = engine.search_properties(&document, &criteria)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/seleccionar-predios" => {
            let chips = parameter_list(params, &["chips", "predios"]);
            let outcome = engine.select_properties(&document, &chips)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/validar-seleccion" => {
            let confirmed = parameter_flag(params, &["confirmado"])?.unwrap_or(false);
            let outcome = engine.validate_selection(&document, confirmed)?;
            ActionBody::ok(outcome.message.clone(), to_data(&outcome))
        }
        "/generar-certificados" => {
            let full_name = parameter_text(params, &["nombreCompleto"]);
            let report = engine.issue_certificates(&document, full_name.as_deref())?;
            let message = format!(
                "{} certificate(s) sent to the registered email, {} failed",
                report.total_sent, report.total_failed
            );
            ActionBody::ok(message, to_data(&report))
        }
        "/consultar-certificados" => {
            let history = engine.certificate_history(&document)?;
            let message = if history.is_empty() {
                "no certificate requests found for this document".to_string()
            } else {
                format!("{} certificate request(s) found", history.len())
            };
            ActionBody::ok(message, json!({"total": history.len(), "certificates": history}))
        }
        "/estado-sesion" => {
            let status = engine.session_status(&document)?;
            let message = if status.active {
                format!("session is active in state {}", status.state)
            } else {
                "no active session; the workflow starts with consent".to_string()
            };
            ActionBody::ok(message, to_data(&status))
        }
        "/reiniciar-sesion" => {
            let report = engine.restart(&document)?;
            ActionBody::ok(report.message.clone(), to_data(&report))
        }
        _ => return Ok(None),
    };
    Ok(Some(body))
}

fn is_known_path(path: &str) -> bool {
    matches!(
        path,
        "/aceptar-consentimiento"
            | "/validar-identidad"
            | "/reenviar-otp"
            | "/validar-otp"
            | "/contar-predios"
            | "/listar-predios"
            | "/buscar-predios"
            | "/seleccionar-predios"
            | "/validar-seleccion"
            | "/generar-certificados"
            | "/consultar-certificados"
            | "/estado-sesion"
            | "/reiniciar-sesion"
    )
}

fn to_data(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parameter_text(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| match params.get(*key)? {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .filter(|text| !text.is_empty())
}

/// The code as typed. Numeric values lost their leading zeros in transit.
fn otp_code(params: &Map<String, Value>) -> Result<String, WorkflowError> {
    let code = ["codigo", "codigoOtp"]
        .iter()
        .find_map(|key| match params.get(*key)? {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(match number.as_u64() {
                Some(digits) => format!("{digits:0width$}", width = OTP_CODE_LENGTH),
                None => number.to_string(),
            }),
            _ => None,
        })
        .filter(|code| !code.is_empty());
    code.ok_or_else(|| WorkflowError::InvalidInput("parameter `codigo` is required".to_string()))
}

fn required_text(
    params: &Map<String, Value>,
    keys: &[&str],
    label: &str,
) -> Result<String, WorkflowError> {
    parameter_text(params, keys)
        .ok_or_else(|| WorkflowError::InvalidInput(format!("parameter `{label}` is required")))
}

fn parameter_flag(params: &Map<String, Value>, keys: &[&str]) -> Result<Option<bool>, WorkflowError> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|key| params.get(*key).map(|value| (*key, value)))
    else {
        return Ok(None);
    };
    match value {
        Value::Bool(flag) => Ok(Some(*flag)),
        Value::String(text) => match text.trim().to_lowercase().as_str() {
            "true" | "si" | "sí" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => Err(WorkflowError::InvalidInput(format!(
                "parameter `{key}` must be true or false"
            ))),
        },
        _ => Err(WorkflowError::InvalidInput(format!(
            "parameter `{key}` must be true or false"
        ))),
    }
}

/// Accepts a JSON array, a JSON-encoded array string, or a comma list.
fn parameter_list(params: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let Some(value) = keys.iter().find_map(|key| params.get(*key)) else {
        return Vec::new();
    };
    let from_array = |items: &[Value]| {
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.trim().to_string()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
    };
    match value {
        Value::Array(items) => from_array(items),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => from_array(&items),
            _ => text
                .trim_matches(|c| c == '[' || c == ']')
                .split(',')
                .map(|chip| chip.trim().trim_matches('"').to_string())
                .filter(|chip| !chip.is_empty())
                .collect(),
        },
        _ => Vec::new(),
    }
}
