//! Request and response bodies. JSON uses camelCase; money is a decimal string.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::{BankAccount, Invoice, Match, Transaction};
use crate::services::ingest::{is_currency_code, RowError};

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if is_currency_code(code) {
        Ok(())
    } else {
        Err(ValidationError::new("currency"))
    }
}

fn default_page_size() -> i32 {
    50
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestTransactionsRequest {
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub transactions: Vec<serde_json::Value>,
    pub synced_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestTransactionsResponse {
    pub success: bool,
    pub inserted: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_details: Vec<RowError>,
}

// ============================================================================
// Bank accounts
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBankAccountRequest {
    #[validate(length(min = 1, max = 64, message = "provider is required"))]
    pub provider: String,
    #[validate(length(min = 1, max = 255, message = "providerAccountId is required"))]
    pub provider_account_id: String,
    #[validate(length(min = 1, max = 255, message = "name is required"))]
    pub name: String,
    #[validate(length(max = 34, message = "iban is too long"))]
    pub iban: Option<String>,
    #[validate(custom(function = "validate_currency", message = "Invalid currency code"))]
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccountResponse {
    pub id: Uuid,
    pub provider: String,
    pub provider_account_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: String,
    pub status: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<BankAccount> for BankAccountResponse {
    fn from(a: BankAccount) -> Self {
        Self {
            id: a.bank_account_id,
            provider: a.provider,
            provider_account_id: a.provider_account_id,
            name: a.name,
            iban: a.iban,
            currency: a.currency,
            status: a.status,
            last_sync_at: a.last_sync_at,
            created_at: a.created_utc,
            updated_at: a.updated_utc,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_id: String,
    pub source: String,
    pub booking_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub status: String,
    pub allocated_amount: Decimal,
    pub remaining_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.transaction_id,
            account_id: t.bank_account_id,
            external_id: t.source_id,
            source: t.source,
            booking_date: t.booking_date,
            value_date: t.value_date,
            amount: t.amount,
            currency: t.currency,
            description: t.description,
            counterparty_name: t.counterparty_name,
            counterparty_iban: t.counterparty_iban,
            reference: t.reference,
            status: t.status,
            allocated_amount: t.allocated_amount,
            remaining_amount: t.remaining_amount,
            created_at: t.created_utc,
            updated_at: t.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetailResponse {
    #[serde(flatten)]
    pub transaction: TransactionResponse,
    pub matches: Vec<MatchResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTransactionsQuery {
    pub account_id: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTransactionStatusRequest {
    pub status: String,
}

// ============================================================================
// Invoices
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    #[validate(length(min = 1, max = 64, message = "invoiceNumber is required"))]
    pub invoice_number: String,
    #[validate(length(min = 1, max = 255, message = "counterpartyName is required"))]
    pub counterparty_name: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    #[validate(custom(function = "validate_currency", message = "Invalid currency code"))]
    pub currency: String,
    pub amount_incl_vat: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub id: Uuid,
    pub invoice_number: String,
    pub counterparty_name: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub amount_incl_vat: Decimal,
    pub settled_amount: Decimal,
    pub open_amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Invoice> for InvoiceResponse {
    fn from(i: Invoice) -> Self {
        Self {
            id: i.invoice_id,
            invoice_number: i.invoice_number,
            counterparty_name: i.counterparty_name,
            issue_date: i.issue_date,
            due_date: i.due_date,
            currency: i.currency,
            amount_incl_vat: i.amount_incl_vat,
            settled_amount: i.settled_amount,
            open_amount: i.open_amount,
            status: i.status,
            created_at: i.created_utc,
            updated_at: i.updated_utc,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<String>,
}

// ============================================================================
// Matches
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationItem {
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMatchesRequest {
    #[validate(length(min = 1, max = 100, message = "between 1 and 100 allocations are allowed"))]
    pub allocations: Vec<AllocationItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub matched_amount: Decimal,
    pub matched_by: String,
    pub created_at: DateTime<Utc>,
}

impl From<Match> for MatchResponse {
    fn from(m: Match) -> Self {
        Self {
            id: m.match_id,
            transaction_id: m.transaction_id,
            invoice_id: m.invoice_id,
            matched_amount: m.matched_amount,
            matched_by: m.matched_by,
            created_at: m.created_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateMatchesResponse {
    pub matches: Vec<MatchResponse>,
    pub transactions: Vec<TransactionResponse>,
    pub invoices: Vec<InvoiceResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMatchesQuery {
    pub transaction_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
}
