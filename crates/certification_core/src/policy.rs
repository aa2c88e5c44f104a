//! Tunable business rules.
//!
//! Defaults reproduce the deployed agent: three certificates per citizen per
//! day, a ten-minute idle session, listing for up to ten properties, and three
//! OTP attempts.

use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Utc};

use crate::error::WorkflowError;
use crate::retry::RetryPolicy;

pub const DEFAULT_DAILY_CERTIFICATE_QUOTA: u32 = 3;
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 600;
pub const DEFAULT_LISTING_THRESHOLD: u32 = 10;
pub const DEFAULT_MAX_SELECTION: usize = 3;
pub const DEFAULT_OTP_ATTEMPTS: u8 = 3;
pub const DEFAULT_OTP_CODE_TTL_SECS: u64 = 300;
pub const DEFAULT_AUTH_TOKEN_TTL_SECS: u64 = 600;
/// Bogotá has no daylight saving time, so a fixed offset is exact.
pub const DEFAULT_QUOTA_UTC_OFFSET_HOURS: i32 = -5;
pub const DEFAULT_STORE_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPolicy {
    pub daily_certificate_quota: u32,
    pub session_idle_secs: u64,
    /// Property counts above this value force the search-only path.
    pub listing_threshold: u32,
    pub max_selection: usize,
    pub otp_attempts: u8,
    pub otp_code_ttl_secs: u64,
    /// Used when the OTP collaborator does not report a token lifetime.
    pub auth_token_ttl_secs: u64,
    pub quota_utc_offset_hours: i32,
    pub store_conflict_retries: u32,
    pub upstream_retry: RetryPolicy,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            daily_certificate_quota: DEFAULT_DAILY_CERTIFICATE_QUOTA,
            session_idle_secs: DEFAULT_SESSION_IDLE_SECS,
            listing_threshold: DEFAULT_LISTING_THRESHOLD,
            max_selection: DEFAULT_MAX_SELECTION,
            otp_attempts: DEFAULT_OTP_ATTEMPTS,
            otp_code_ttl_secs: DEFAULT_OTP_CODE_TTL_SECS,
            auth_token_ttl_secs: DEFAULT_AUTH_TOKEN_TTL_SECS,
            quota_utc_offset_hours: DEFAULT_QUOTA_UTC_OFFSET_HOURS,
            store_conflict_retries: DEFAULT_STORE_CONFLICT_RETRIES,
            upstream_retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowPolicy {
    pub fn validate(self) -> Result<Self, WorkflowError> {
        if self.daily_certificate_quota == 0 {
            return Err(WorkflowError::InvalidInput(
                "daily_certificate_quota must be a positive integer".to_string(),
            ));
        }
        if self.session_idle_secs == 0 {
            return Err(WorkflowError::InvalidInput(
                "session_idle_secs must be a positive integer".to_string(),
            ));
        }
        if self.max_selection == 0 {
            return Err(WorkflowError::InvalidInput(
                "max_selection must be a positive integer".to_string(),
            ));
        }
        if self.otp_attempts == 0 {
            return Err(WorkflowError::InvalidInput(
                "otp_attempts must be a positive integer".to_string(),
            ));
        }
        if !(-12..=14).contains(&self.quota_utc_offset_hours) {
            return Err(WorkflowError::InvalidInput(format!(
                "quota_utc_offset_hours={} is outside -12..=14",
                self.quota_utc_offset_hours
            )));
        }
        if self.upstream_retry.max_attempts == 0 {
            return Err(WorkflowError::InvalidInput(
                "upstream retry max_attempts must be a positive integer".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn session_idle(&self) -> TimeDelta {
        secs(self.session_idle_secs)
    }

    pub fn otp_code_ttl(&self) -> TimeDelta {
        secs(self.otp_code_ttl_secs)
    }

    pub fn auth_token_ttl(&self) -> TimeDelta {
        secs(self.auth_token_ttl_secs)
    }

    pub fn quota_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.quota_utc_offset_hours * 3_600).unwrap_or_else(|| Utc.fix())
    }
}

pub(crate) fn secs(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// `start + ttl`, pinned to the latest representable instant on overflow.
pub(crate) fn deadline(start: DateTime<Utc>, ttl: TimeDelta) -> DateTime<Utc> {
    start
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
