//! Daily per-citizen certificate allotment.
//!
//! The ledger is only ever incremented through [`QuotaLedger::try_consume`],
//! which is atomic per document and day: either every requested unit fits
//! under the limit and all are recorded, or nothing changes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Accepted { used: u32 },
    Exceeded { used: u32 },
}

pub trait QuotaLedger {
    fn used(&self, document: &str, day: NaiveDate) -> Result<u32, String>;

    fn try_consume(
        &self,
        document: &str,
        day: NaiveDate,
        units: u32,
        limit: u32,
    ) -> Result<QuotaDecision, String>;
}

/// Calendar day `now` falls on in the ledger's local offset.
pub fn quota_day(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    counters: Mutex<HashMap<(String, NaiveDate), u32>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaLedger for InMemoryQuotaLedger {
    fn used(&self, document: &str, day: NaiveDate) -> Result<u32, String> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| "quota ledger lock poisoned".to_string())?;
        Ok(counters
            .get(&(document.to_string(), day))
            .copied()
            .unwrap_or(0))
    }

    fn try_consume(
        &self,
        document: &str,
        day: NaiveDate,
        units: u32,
        limit: u32,
    ) -> Result<QuotaDecision, String> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| "quota ledger lock poisoned".to_string())?;
        let used = counters.entry((document.to_string(), day)).or_insert(0);
        match used.checked_add(units) {
            Some(next) if next <= limit => {
                *used = next;
                Ok(QuotaDecision::Accepted { used: next })
            }
            _ => Ok(QuotaDecision::Exceeded { used: *used }),
        }
    }
}
