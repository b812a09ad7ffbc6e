//! Domain models for reconciliation-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// Money columns are NUMERIC(19, 4).
pub const MONEY_SCALE: u32 = 4;

// ============================================================================
// Bank Account Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankAccountStatus {
    Active,
    Inactive,
}

impl BankAccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Inactive,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BankAccount {
    pub bank_account_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub provider_account_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: String,
    pub status: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl BankAccount {
    pub fn is_active(&self) -> bool {
        BankAccountStatus::from_str(&self.status) == BankAccountStatus::Active
    }
}

/// Input for registering a provider account.
#[derive(Debug, Clone)]
pub struct NewBankAccount {
    pub provider: String,
    pub provider_account_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: String,
}

// ============================================================================
// Transaction Models
// ============================================================================

/// Lifecycle: `pending -> unconsidered | unmatched -> matched | ignored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Unmatched,
    Unconsidered,
    Matched,
    Ignored,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Unmatched => "unmatched",
            Self::Unconsidered => "unconsidered",
            Self::Matched => "matched",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "unmatched" => Some(Self::Unmatched),
            "unconsidered" => Some(Self::Unconsidered),
            "matched" => Some(Self::Matched),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Pending)
    }

    /// Whether the transaction can receive allocations.
    pub fn is_matchable(&self) -> bool {
        matches!(self, Self::Unmatched | Self::Unconsidered)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Matched | Self::Ignored)
    }

    /// Transitions a user may request directly. `matched` is only reached
    /// through allocation.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Unmatched)
                | (Self::Pending, Self::Unconsidered)
                | (Self::Unmatched, Self::Ignored)
                | (Self::Unconsidered, Self::Ignored)
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub bank_account_id: Uuid,
    pub source_id: String,
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
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// A validated row ready to be inserted by the ingestion batch.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub source_id: String,
    pub booking_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub status: TransactionStatus,
}

// ============================================================================
// Invoice Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(Self::Unpaid),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Unpaid)
    }

    /// Whether the invoice can still be settled.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Paid | Self::Cancelled)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_number: String,
    pub counterparty_name: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub amount_incl_vat: Decimal,
    pub settled_amount: Decimal,
    pub open_amount: Decimal,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub counterparty_name: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub currency: String,
    pub amount_incl_vat: Decimal,
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Match {
    pub match_id: Uuid,
    pub tenant_id: Uuid,
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub matched_amount: Decimal,
    pub matched_by: String,
    pub created_utc: DateTime<Utc>,
}

/// One requested allocation; `amount: None` allocates the maximum.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Option<Decimal>,
}

/// Rows written by one matching request.
#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub matches: Vec<Match>,
    pub transactions: Vec<Transaction>,
    pub invoices: Vec<Invoice>,
}

impl AllocationOutcome {
    pub fn paid_invoice_ids(&self) -> Vec<Uuid> {
        self.invoices
            .iter()
            .filter(|i| InvoiceStatus::from_str(&i.status) == InvoiceStatus::Paid)
            .map(|i| i.invoice_id)
            .collect()
    }
}
