//! Environment configuration for the agent action Lambda.

use std::str::FromStr;
use std::time::Duration;

use certification_core::policy::WorkflowPolicy;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
/// Certificate generation renders a document upstream and is slower than lookups.
pub const DEFAULT_CERTIFICATE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CERTIFICATE_DOCUMENT_INDEX: &str = "numeroIdentificacion-index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaConfig {
    pub session_table: String,
    pub certificate_table: String,
    pub certificate_document_index: String,
    pub cert_api_base_url: String,
    pub identity_api_url: String,
    pub http_timeout: Duration,
    pub certificate_timeout: Duration,
    /// The identity endpoint also sends the temporary key by email.
    pub identity_sends_otp: bool,
    pub policy: WorkflowPolicy,
}

impl LambdaConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| format!("{key} must be configured"))
        };

        let defaults = WorkflowPolicy::default();
        let mut policy = defaults.clone();
        policy.daily_certificate_quota = parse_or(
            &lookup,
            "DAILY_CERTIFICATE_QUOTA",
            defaults.daily_certificate_quota,
        )?;
        policy.session_idle_secs =
            parse_or(&lookup, "SESSION_IDLE_SECONDS", defaults.session_idle_secs)?;
        policy.listing_threshold =
            parse_or(&lookup, "LISTING_THRESHOLD", defaults.listing_threshold)?;
        policy.max_selection = parse_or(&lookup, "MAX_SELECTION", defaults.max_selection)?;
        policy.otp_attempts = parse_or(&lookup, "OTP_ATTEMPTS", defaults.otp_attempts)?;
        policy.otp_code_ttl_secs =
            parse_or(&lookup, "OTP_CODE_TTL_SECONDS", defaults.otp_code_ttl_secs)?;
        policy.auth_token_ttl_secs =
            parse_or(&lookup, "AUTH_TOKEN_TTL_SECONDS", defaults.auth_token_ttl_secs)?;
        policy.quota_utc_offset_hours = parse_or(
            &lookup,
            "QUOTA_UTC_OFFSET_HOURS",
            defaults.quota_utc_offset_hours,
        )?;
        policy.store_conflict_retries = parse_or(
            &lookup,
            "STORE_CONFLICT_RETRIES",
            defaults.store_conflict_retries,
        )?;
        policy.upstream_retry.max_attempts = parse_or(
            &lookup,
            "UPSTREAM_MAX_ATTEMPTS",
            defaults.upstream_retry.max_attempts,
        )?;
        policy.upstream_retry.initial_backoff_ms = parse_or(
            &lookup,
            "UPSTREAM_INITIAL_BACKOFF_MS",
            defaults.upstream_retry.initial_backoff_ms,
        )?;
        policy.upstream_retry.max_backoff_ms = parse_or(
            &lookup,
            "UPSTREAM_MAX_BACKOFF_MS",
            defaults.upstream_retry.max_backoff_ms,
        )?;
        let policy = policy.validate().map_err(|error| error.to_string())?;

        Ok(Self {
            session_table: required("SESSION_TABLE")?,
            certificate_table: required("CERTIFICATE_TABLE")?,
            certificate_document_index: lookup("CERTIFICATE_DOCUMENT_INDEX")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CERTIFICATE_DOCUMENT_INDEX.to_string()),
            cert_api_base_url: required("CERT_API_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            identity_api_url: required("IDENTITY_API_URL")?,
            http_timeout: Duration::from_secs(parse_or(
                &lookup,
                "HTTP_TIMEOUT_SECONDS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            certificate_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CERTIFICATE_TIMEOUT_SECONDS",
                DEFAULT_CERTIFICATE_TIMEOUT_SECS,
            )?),
            identity_sends_otp: parse_or(&lookup, "IDENTITY_SENDS_OTP", true)?,
            policy,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| format!("{key}={raw} is not a valid value")),
        _ => Ok(default),
    }
}
