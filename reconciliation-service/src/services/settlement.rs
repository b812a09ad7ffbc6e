//! Settlement bookkeeping for transaction-to-invoice allocations.
//!
//! The engine works on in-memory balances of rows that the caller has
//! already locked, so a request with several allocations touching the same
//! transaction or invoice sees its own earlier allocations.

use crate::models::{Invoice, InvoiceStatus, Transaction, TransactionStatus, MONEY_SCALE};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum SettlementError {
    #[error("Allocation amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Allocation amount {0} has more than {max} decimal places", max = MONEY_SCALE)]
    TooPrecise(Decimal),

    #[error("Currency mismatch: transaction is {transaction}, invoice is {invoice}")]
    CurrencyMismatch { transaction: String, invoice: String },

    #[error("Allocation of {requested} exceeds the available {available}")]
    ExceedsAvailable { requested: Decimal, available: Decimal },

    #[error("Nothing left to allocate between transaction {transaction_id} and invoice {invoice_id}")]
    NothingToAllocate { transaction_id: Uuid, invoice_id: Uuid },

    #[error("Transaction {0} is {1} and cannot be matched")]
    TransactionNotMatchable(Uuid, &'static str),

    #[error("Invoice {0} is {1} and cannot be settled")]
    InvoiceNotOpen(Uuid, &'static str),
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::TransactionNotMatchable(..) | SettlementError::InvoiceNotOpen(..) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            _ => AppError::BadRequest(anyhow::Error::new(err)),
        }
    }
}

/// Settlement state of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionBalance {
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub allocated_amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
}

impl TransactionBalance {
    /// Signed amount still to be allocated (`amount - allocated_amount`).
    pub fn remaining(&self) -> Decimal {
        self.amount - self.allocated_amount
    }

    /// Unsigned amount that can still be allocated.
    pub fn available(&self) -> Decimal {
        self.remaining().abs()
    }
}

impl From<&Transaction> for TransactionBalance {
    fn from(t: &Transaction) -> Self {
        Self {
            transaction_id: t.transaction_id,
            amount: t.amount,
            allocated_amount: t.allocated_amount,
            currency: t.currency.clone(),
            status: TransactionStatus::from_str(&t.status),
        }
    }
}

/// Settlement state of one invoice.
#[derive(Debug, Clone)]
pub struct InvoiceBalance {
    pub invoice_id: Uuid,
    pub amount_incl_vat: Decimal,
    pub settled_amount: Decimal,
    pub currency: String,
    pub due_date: NaiveDate,
    pub status: InvoiceStatus,
}

impl InvoiceBalance {
    pub fn open_amount(&self) -> Decimal {
        self.amount_incl_vat - self.settled_amount
    }
}

impl From<&Invoice> for InvoiceBalance {
    fn from(i: &Invoice) -> Self {
        Self {
            invoice_id: i.invoice_id,
            amount_incl_vat: i.amount_incl_vat,
            settled_amount: i.settled_amount,
            currency: i.currency.clone(),
            due_date: i.due_date,
            status: InvoiceStatus::from_str(&i.status),
        }
    }
}

/// Status of a non-cancelled invoice given how much of it is settled.
pub fn derive_invoice_status(
    amount_incl_vat: Decimal,
    settled_amount: Decimal,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    let open = amount_incl_vat - settled_amount;
    if open <= Decimal::ZERO {
        InvoiceStatus::Paid
    } else if settled_amount > Decimal::ZERO {
        InvoiceStatus::Partial
    } else if due_date < today {
        InvoiceStatus::Overdue
    } else {
        InvoiceStatus::Unpaid
    }
}

/// Allocate part of a transaction to an invoice.
///
/// With `requested == None` the largest possible amount is allocated.
/// Returns the allocated (unsigned) amount. Both balances are left
/// untouched on error.
pub fn allocate(
    txn: &mut TransactionBalance,
    invoice: &mut InvoiceBalance,
    requested: Option<Decimal>,
    today: NaiveDate,
) -> Result<Decimal, SettlementError> {
    if !txn.status.is_matchable() {
        return Err(SettlementError::TransactionNotMatchable(
            txn.transaction_id,
            txn.status.as_str(),
        ));
    }
    if !invoice.status.is_open() {
        return Err(SettlementError::InvoiceNotOpen(
            invoice.invoice_id,
            invoice.status.as_str(),
        ));
    }
    if !txn.currency.eq_ignore_ascii_case(&invoice.currency) {
        return Err(SettlementError::CurrencyMismatch {
            transaction: txn.currency.clone(),
            invoice: invoice.currency.clone(),
        });
    }

    let available = txn.available().min(invoice.open_amount());

    let amount = match requested {
        Some(amount) => {
            if amount <= Decimal::ZERO {
                return Err(SettlementError::NonPositiveAmount(amount));
            }
            if amount.normalize().scale() > MONEY_SCALE {
                return Err(SettlementError::TooPrecise(amount));
            }
            amount
        }
        None => available,
    };

    if available <= Decimal::ZERO {
        return Err(SettlementError::NothingToAllocate {
            transaction_id: txn.transaction_id,
            invoice_id: invoice.invoice_id,
        });
    }
    if amount > available {
        return Err(SettlementError::ExceedsAvailable {
            requested: amount,
            available,
        });
    }

    // Allocation follows the sign of the transaction so that
    // remaining = amount - allocated shrinks toward zero for outflows too.
    if txn.amount.is_sign_negative() {
        txn.allocated_amount -= amount;
    } else {
        txn.allocated_amount += amount;
    }
    if txn.remaining().is_zero() {
        txn.status = TransactionStatus::Matched;
    }

    invoice.settled_amount += amount;
    invoice.status = derive_invoice_status(
        invoice.amount_incl_vat,
        invoice.settled_amount,
        invoice.due_date,
        today,
    );

    Ok(amount)
}
