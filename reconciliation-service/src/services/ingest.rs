//! Per-row validation for ingestion batches.
//!
//! The batch envelope is typed; rows arrive as raw JSON so one malformed
//! row is reported on its own instead of failing the whole request.

use crate::models::{NewTransaction, TransactionStatus, MONEY_SCALE};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_EXTERNAL_ID_LEN: usize = 255;
const MAX_TEXT_LEN: usize = 1000;

/// One provider transaction as sent by the sync worker.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestRow {
    external_id: String,
    booking_date: NaiveDate,
    value_date: Option<NaiveDate>,
    amount: Decimal,
    currency: String,
    description: Option<String>,
    counterparty_name: Option<String>,
    counterparty_iban: Option<String>,
    reference: Option<String>,
    status: Option<String>,
}

/// A row that could not be ingested.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub error: String,
}

impl RowError {
    pub fn new(index: usize, external_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            index,
            external_id,
            error: error.into(),
        }
    }
}

/// Result of writing one batch.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub inserted_ids: Vec<Uuid>,
    pub skipped: usize,
    pub errors: Vec<RowError>,
}

impl IngestOutcome {
    pub fn inserted(&self) -> usize {
        self.inserted_ids.len()
    }
}

/// Validate one raw row and turn it into an insertable transaction.
pub fn parse_row(index: usize, raw: &serde_json::Value) -> Result<NewTransaction, RowError> {
    let external_id = raw
        .get("externalId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let row: IngestRow = serde_json::from_value(raw.clone())
        .map_err(|e| RowError::new(index, external_id.clone(), format!("Invalid row: {}", e)))?;

    let fail = |msg: &str| RowError::new(index, Some(row.external_id.clone()), msg);

    let source_id = row.external_id.trim();
    if source_id.is_empty() {
        return Err(fail("externalId must not be empty"));
    }
    if source_id.len() > MAX_EXTERNAL_ID_LEN {
        return Err(fail("externalId is too long"));
    }
    if row.amount.normalize().scale() > MONEY_SCALE {
        return Err(fail("amount has too many decimal places"));
    }
    if !is_currency_code(&row.currency) {
        return Err(fail("currency must be a three-letter ISO 4217 code"));
    }

    let status = match row.status.as_deref() {
        None | Some("booked") => TransactionStatus::Unmatched,
        Some("pending") => TransactionStatus::Pending,
        Some(_) => return Err(fail("status must be 'booked' or 'pending'")),
    };

    Ok(NewTransaction {
        source_id: source_id.to_string(),
        booking_date: row.booking_date,
        value_date: row.value_date,
        amount: row.amount,
        currency: row.currency.to_ascii_uppercase(),
        description: clip(row.description),
        counterparty_name: clip(row.counterparty_name),
        counterparty_iban: row
            .counterparty_iban
            .map(|iban| iban.replace(' ', "").to_ascii_uppercase())
            .filter(|iban| !iban.is_empty()),
        reference: clip(row.reference),
        status,
    })
}

pub fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

fn clip(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().chars().take(MAX_TEXT_LEN).collect::<String>())
        .filter(|v| !v.is_empty())
}
