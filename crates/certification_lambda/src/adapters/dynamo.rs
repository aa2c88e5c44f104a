//! DynamoDB-backed session store, quota ledger and certificate audit table.
//!
//! Sessions are stored as a JSON payload next to a handful of top-level
//! attributes the table needs natively: the partition key, the optimistic
//! `version`, and the `ttl` epoch used for expiry. Quota ledger rows share the
//! session table under a prefixed key.

use std::collections::HashMap;
use std::future::Future;

use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use certification_core::certificate::{CertificateRecord, CertificateStatus};
use certification_core::contract::DocumentType;
use certification_core::quota::{QuotaDecision, QuotaLedger};
use certification_core::session::Session;
use certification_core::storage_keys::{
    quota_ledger_key, quota_row_expiry, session_key, ttl_epoch_seconds,
    CERTIFICATE_PARTITION_ATTRIBUTE, SESSION_PARTITION_ATTRIBUTE,
};
use certification_core::store::{CertificateStore, PutOutcome, SessionStore};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use uuid::Uuid;

type Item = HashMap<String, AttributeValue>;

const VERSION_ATTRIBUTE: &str = "version";
const TTL_ATTRIBUTE: &str = "ttl";
const PAYLOAD_ATTRIBUTE: &str = "payload";
const USED_ATTRIBUTE: &str = "used";
const DOCUMENT_INDEX_ATTRIBUTE: &str = "numeroIdentificacion";

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

fn string_attribute(item: &Item, name: &str) -> Option<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .map(String::to_string)
}

fn number_attribute(item: &Item, name: &str) -> Option<u64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|raw| raw.parse().ok())
}

fn timestamp_attribute(item: &Item, name: &str) -> Result<DateTime<Utc>, String> {
    let raw = string_attribute(item, name).ok_or_else(|| format!("item is missing `{name}`"))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| format!("`{name}` is not an RFC 3339 timestamp: {error}"))
}

pub fn session_item(session: &Session, idle: TimeDelta) -> Result<Item, String> {
    let payload = serde_json::to_string(session)
        .map_err(|error| format!("failed to serialize session: {error}"))?;
    let mut item = Item::new();
    item.insert(
        SESSION_PARTITION_ATTRIBUTE.to_string(),
        AttributeValue::S(session_key(&session.document)),
    );
    item.insert(
        VERSION_ATTRIBUTE.to_string(),
        AttributeValue::N(session.version.to_string()),
    );
    item.insert(
        TTL_ATTRIBUTE.to_string(),
        AttributeValue::N(ttl_epoch_seconds(session.expires_at(idle)).to_string()),
    );
    item.insert(
        "estado".to_string(),
        AttributeValue::S(session.state.as_str().to_string()),
    );
    item.insert(
        "schema_version".to_string(),
        AttributeValue::S(session.schema_version.clone()),
    );
    item.insert(PAYLOAD_ATTRIBUTE.to_string(), AttributeValue::S(payload));
    Ok(item)
}

pub fn session_from_item(item: &Item) -> Result<Session, String> {
    let payload = string_attribute(item, PAYLOAD_ATTRIBUTE)
        .ok_or_else(|| "session item has no payload".to_string())?;
    let mut session: Session = serde_json::from_str(&payload)
        .map_err(|error| format!("failed to deserialize session: {error}"))?;
    // The top-level attribute is the one conditional writes compare against.
    if let Some(version) = number_attribute(item, VERSION_ATTRIBUTE) {
        session.version = version;
    }
    Ok(session)
}

pub fn certificate_item(record: &CertificateRecord) -> Item {
    let mut item = Item::new();
    let mut put = |name: &str, value: String| {
        item.insert(name.to_string(), AttributeValue::S(value));
    };
    put(CERTIFICATE_PARTITION_ATTRIBUTE, record.request_id.to_string());
    put("nombreCompleto", record.full_name.clone());
    put("tipoDocumento", record.document_type.as_str().to_string());
    put(DOCUMENT_INDEX_ATTRIBUTE, record.document.clone());
    put("fechaHora", record.requested_at.to_rfc3339());
    put("fechaActualizacion", record.updated_at.to_rfc3339());
    put("chip", record.chip.clone());
    put("estado", record.status.as_str().to_string());
    if let Some(request_number) = &record.request_number {
        put("numeroRadicado", request_number.clone());
    }
    if let Some(failure) = &record.failure {
        put("error", failure.clone());
    }
    item
}

pub fn certificate_from_item(item: &Item) -> Result<CertificateRecord, String> {
    let required = |name: &str| {
        string_attribute(item, name).ok_or_else(|| format!("certificate item is missing `{name}`"))
    };
    let request_id = Uuid::parse_str(&required(CERTIFICATE_PARTITION_ATTRIBUTE)?)
        .map_err(|error| format!("invalid certificate id: {error}"))?;
    let document_type = required("tipoDocumento")?
        .parse::<DocumentType>()
        .map_err(|error| format!("invalid document type: {error}"))?;
    let status = match required("estado")?.as_str() {
        "pending" => CertificateStatus::Pending,
        "sent" => CertificateStatus::Sent,
        "failed" => CertificateStatus::Failed,
        other => return Err(format!("unknown certificate status `{other}`")),
    };
    let requested_at = timestamp_attribute(item, "fechaHora")?;

    Ok(CertificateRecord {
        request_id,
        document: required(DOCUMENT_INDEX_ATTRIBUTE)?,
        document_type,
        full_name: required("nombreCompleto")?,
        chip: required("chip")?,
        status,
        request_number: string_attribute(item, "numeroRadicado"),
        failure: string_attribute(item, "error"),
        requested_at,
        updated_at: timestamp_attribute(item, "fechaActualizacion").unwrap_or(requested_at),
    })
}

pub struct DynamoSessionStore {
    pub client: Client,
    pub table: String,
    pub idle: TimeDelta,
}

impl SessionStore for DynamoSessionStore {
    fn get(&self, document: &str) -> Result<Option<Session>, String> {
        let output = block_on(
            self.client
                .get_item()
                .table_name(&self.table)
                .key(
                    SESSION_PARTITION_ATTRIBUTE,
                    AttributeValue::S(session_key(document)),
                )
                .consistent_read(true)
                .send(),
        )
        .map_err(|error| format!("failed to read session: {error}"))?;
        output.item().map(session_from_item).transpose()
    }

    fn put(&self, session: &Session, expected_version: Option<u64>) -> Result<PutOutcome, String> {
        let request = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(session_item(session, self.idle)?));
        let request = match expected_version {
            None => request.condition_expression(format!(
                "attribute_not_exists({SESSION_PARTITION_ATTRIBUTE})"
            )),
            Some(expected) => request
                .condition_expression("#version = :expected")
                .expression_attribute_names("#version", VERSION_ATTRIBUTE)
                .expression_attribute_values(":expected", AttributeValue::N(expected.to_string())),
        };

        match block_on(request.send()) {
            Ok(_) => Ok(PutOutcome::Written),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Ok(PutOutcome::Conflict)
            }
            Err(error) => Err(format!("failed to write session: {error}")),
        }
    }

    fn delete(&self, document: &str) -> Result<(), String> {
        block_on(
            self.client
                .delete_item()
                .table_name(&self.table)
                .key(
                    SESSION_PARTITION_ATTRIBUTE,
                    AttributeValue::S(session_key(document)),
                )
                .send(),
        )
        .map(|_| ())
        .map_err(|error| format!("failed to delete session: {error}"))
    }
}

/// Per-day counters kept in the session table.
pub struct DynamoQuotaLedger {
    pub client: Client,
    pub table: String,
}

impl QuotaLedger for DynamoQuotaLedger {
    fn used(&self, document: &str, day: NaiveDate) -> Result<u32, String> {
        let output = block_on(
            self.client
                .get_item()
                .table_name(&self.table)
                .key(
                    SESSION_PARTITION_ATTRIBUTE,
                    AttributeValue::S(quota_ledger_key(document, day)),
                )
                .consistent_read(true)
                .send(),
        )
        .map_err(|error| format!("failed to read quota ledger: {error}"))?;
        Ok(output
            .item()
            .and_then(|item| number_attribute(item, USED_ATTRIBUTE))
            .map(|used| u32::try_from(used).unwrap_or(u32::MAX))
            .unwrap_or(0))
    }

    fn try_consume(
        &self,
        document: &str,
        day: NaiveDate,
        units: u32,
        limit: u32,
    ) -> Result<QuotaDecision, String> {
        if units > limit {
            return Ok(QuotaDecision::Exceeded {
                used: self.used(document, day)?,
            });
        }
        let max_before = limit - units;
        let result = block_on(
            self.client
                .update_item()
                .table_name(&self.table)
                .key(
                    SESSION_PARTITION_ATTRIBUTE,
                    AttributeValue::S(quota_ledger_key(document, day)),
                )
                .update_expression("SET #ttl = :ttl ADD #used :units")
                .condition_expression("attribute_not_exists(#used) OR #used <= :max_before")
                .expression_attribute_names("#used", USED_ATTRIBUTE)
                .expression_attribute_names("#ttl", TTL_ATTRIBUTE)
                .expression_attribute_values(":units", AttributeValue::N(units.to_string()))
                .expression_attribute_values(
                    ":max_before",
                    AttributeValue::N(max_before.to_string()),
                )
                .expression_attribute_values(
                    ":ttl",
                    AttributeValue::N(ttl_epoch_seconds(quota_row_expiry(day)).to_string()),
                )
                .return_values(ReturnValue::AllNew)
                .send(),
        );

        match result {
            Ok(output) => {
                let used = output
                    .attributes()
                    .and_then(|item| number_attribute(item, USED_ATTRIBUTE))
                    .map(|used| u32::try_from(used).unwrap_or(u32::MAX))
                    .unwrap_or(units);
                Ok(QuotaDecision::Accepted { used })
            }
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Ok(QuotaDecision::Exceeded {
                    used: self.used(document, day)?,
                })
            }
            Err(error) => Err(format!("failed to update quota ledger: {error}")),
        }
    }
}

pub struct DynamoCertificateStore {
    pub client: Client,
    pub table: String,
    pub document_index: String,
}

impl DynamoCertificateStore {
    fn write(&self, record: &CertificateRecord) -> Result<(), String> {
        block_on(
            self.client
                .put_item()
                .table_name(&self.table)
                .set_item(Some(certificate_item(record)))
                .send(),
        )
        .map(|_| ())
        .map_err(|error| format!("failed to write certificate record: {error}"))
    }
}

impl CertificateStore for DynamoCertificateStore {
    fn insert(&self, record: &CertificateRecord) -> Result<(), String> {
        self.write(record)
    }

    fn update(&self, record: &CertificateRecord) -> Result<(), String> {
        self.write(record)
    }

    fn list_for_document(&self, document: &str) -> Result<Vec<CertificateRecord>, String> {
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let output = block_on(
                self.client
                    .query()
                    .table_name(&self.table)
                    .index_name(&self.document_index)
                    .key_condition_expression("#document = :document")
                    .expression_attribute_names("#document", DOCUMENT_INDEX_ATTRIBUTE)
                    .expression_attribute_values(
                        ":document",
                        AttributeValue::S(document.to_string()),
                    )
                    .set_exclusive_start_key(start_key.take())
                    .send(),
            )
            .map_err(|error| format!("failed to query certificate records: {error}"))?;

            for item in output.items() {
                records.push(certificate_from_item(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        records.sort_by(|left, right| right.requested_at.cmp(&left.requested_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use certification_core::state::WorkflowState;
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn session_item_carries_native_attributes() {
        let mut session = Session::start("123", DocumentType::CC, 3, now());
        session.state = WorkflowState::OtpValidated;
        session.version = 4;

        let item = session_item(&session, TimeDelta::seconds(600)).expect("item");
        assert_eq!(
            item.get("documento").and_then(|v| v.as_s().ok()).map(String::as_str),
            Some("123")
        );
        assert_eq!(number_attribute(&item, "version"), Some(4));
        assert_eq!(
            number_attribute(&item, "ttl"),
            Some((now().timestamp() + 600) as u64)
        );
        assert_eq!(
            string_attribute(&item, "estado").as_deref(),
            Some("otp_validated")
        );

        let decoded = session_from_item(&item).expect("decode");
        assert_eq!(decoded, session);
    }

    #[test]
    fn top_level_version_wins_over_payload() {
        let session = Session::start("123", DocumentType::CC, 3, now());
        let mut item = session_item(&session, TimeDelta::seconds(600)).expect("item");
        item.insert("version".to_string(), AttributeValue::N("9".to_string()));
        assert_eq!(session_from_item(&item).expect("decode").version, 9);
    }

    #[test]
    fn session_item_without_payload_is_an_error() {
        let mut item = Item::new();
        item.insert("documento".to_string(), AttributeValue::S("123".to_string()));
        assert_eq!(
            session_from_item(&item).expect_err("no payload"),
            "session item has no payload"
        );
    }

    #[test]
    fn certificate_item_uses_audit_attribute_names() {
        let mut record =
            CertificateRecord::pending("123", DocumentType::CC, "Ana Pérez", "AAA0001", now());
        record.mark_sent(Some("2026-000123".to_string()), now());

        let item = certificate_item(&record);
        for name in [
            "id",
            "nombreCompleto",
            "tipoDocumento",
            "numeroIdentificacion",
            "fechaHora",
            "numeroRadicado",
            "chip",
            "estado",
        ] {
            assert!(item.contains_key(name), "missing {name}");
        }
        assert!(!item.contains_key("error"));
        assert_eq!(certificate_from_item(&item).expect("decode"), record);
    }

    #[test]
    fn failed_certificate_keeps_its_reason() {
        let mut record =
            CertificateRecord::pending("123", DocumentType::CE, "Ana Pérez", "AAA0002", now());
        record.mark_failed("request timed out", now());

        let decoded = certificate_from_item(&certificate_item(&record)).expect("decode");
        assert_eq!(decoded.status, CertificateStatus::Failed);
        assert_eq!(decoded.failure.as_deref(), Some("request timed out"));
        assert_eq!(decoded.document_type, DocumentType::CE);
    }

    #[test]
    fn unknown_certificate_status_is_rejected() {
        let record =
            CertificateRecord::pending("123", DocumentType::CC, "Ana Pérez", "AAA0003", now());
        let mut item = certificate_item(&record);
        item.insert("estado".to_string(), AttributeValue::S("lost".to_string()));
        assert!(certificate_from_item(&item)
            .expect_err("bad status")
            .contains("lost"));
    }
}
