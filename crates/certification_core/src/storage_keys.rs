//! Partition key layout for the two key-value tables.
//!
//! The session table is keyed by document number. Quota ledger rows share that
//! table under a prefixed key so they outlive the session item that expires
//! after ten idle minutes. Certificate records live in their own table keyed
//! by request id.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

pub const SESSION_PARTITION_ATTRIBUTE: &str = "documento";
pub const CERTIFICATE_PARTITION_ATTRIBUTE: &str = "id";
pub const QUOTA_KEY_PREFIX: &str = "QUOTA#";
/// Ledger rows are kept a little past their day so a late clock still sees them.
pub const QUOTA_ROW_RETENTION_DAYS: i64 = 2;

pub fn session_key(document: &str) -> String {
    document.to_string()
}

pub fn quota_ledger_key(document: &str, day: NaiveDate) -> String {
    format!("{QUOTA_KEY_PREFIX}{document}#{}", day.format("%Y-%m-%d"))
}

/// Epoch seconds consumed by the table's native expiry.
pub fn ttl_epoch_seconds(expires_at: DateTime<Utc>) -> i64 {
    expires_at.timestamp()
}

pub fn quota_row_expiry(day: NaiveDate) -> DateTime<Utc> {
    let start = day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    start + TimeDelta::days(QUOTA_ROW_RETENTION_DAYS)
}
