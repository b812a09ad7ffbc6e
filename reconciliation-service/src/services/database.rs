//! Database service for reconciliation-service.

use crate::models::{
    AllocationOutcome, AllocationRequest, BankAccount, BankAccountStatus, Invoice, InvoiceStatus,
    Match, NewBankAccount, NewInvoice, NewTransaction, Transaction, TransactionStatus,
};
use crate::services::ingest::{IngestOutcome, RowError};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::settlement::{self, InvoiceBalance, TransactionBalance};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Acquire;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const BANK_ACCOUNT_COLUMNS: &str = "bank_account_id, tenant_id, provider, provider_account_id, name, iban, currency, status, last_sync_at, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, tenant_id, bank_account_id, source_id, source, booking_date, value_date, amount, currency, description, counterparty_name, counterparty_iban, reference, status, allocated_amount, remaining_amount, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, invoice_number, counterparty_name, issue_date, due_date, currency, amount_incl_vat, settled_amount, open_amount, status, created_utc, updated_utc";

const MATCH_COLUMNS: &str =
    "match_id, tenant_id, transaction_id, invoice_id, matched_amount, matched_by, created_utc";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Split a page that was fetched with one extra row into items and a cursor.
fn paginate<T>(mut items: Vec<T>, limit: i64, id: impl Fn(&T) -> Uuid) -> (Vec<T>, Option<String>) {
    let has_more = items.len() > limit as usize;
    if has_more {
        items.pop();
    }
    let next_token = if has_more {
        items.last().map(|item| id(item).to_string())
    } else {
        None
    };
    (items, next_token)
}

fn parse_page_token(page_token: Option<&str>) -> Result<Option<Uuid>, AppError> {
    page_token
        .map(|token| {
            Uuid::parse_str(token)
                .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid page_token")))
        })
        .transpose()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Bank Account Operations
    // =========================================================================

    #[instrument(skip(self, account), fields(tenant_id = %tenant_id, provider = %account.provider))]
    pub async fn create_bank_account(
        &self,
        tenant_id: Uuid,
        account: &NewBankAccount,
    ) -> Result<BankAccount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_bank_account"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO bank_accounts (bank_account_id, tenant_id, provider, provider_account_id, name, iban, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {BANK_ACCOUNT_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, BankAccount>(&query)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&account.provider)
            .bind(&account.provider_account_id)
            .bind(&account.name)
            .bind(&account.iban)
            .bind(&account.currency)
            .bind(BankAccountStatus::Active.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(anyhow::anyhow!(
                        "Bank account {} is already registered for provider {}",
                        account.provider_account_id,
                        account.provider
                    ))
                } else {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to create bank account: {}", e))
                }
            })?;

        timer.observe_duration();
        info!(bank_account_id = %created.bank_account_id, "Bank account registered");

        Ok(created)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, bank_account_id = %bank_account_id))]
    pub async fn get_bank_account(
        &self,
        tenant_id: Uuid,
        bank_account_id: Uuid,
    ) -> Result<BankAccount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_bank_account"])
            .start_timer();

        let query = format!(
            "SELECT {BANK_ACCOUNT_COLUMNS} FROM bank_accounts WHERE tenant_id = $1 AND bank_account_id = $2"
        );

        let account = sqlx::query_as::<_, BankAccount>(&query)
            .bind(tenant_id)
            .bind(bank_account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get bank account: {}", e)))?;

        timer.observe_duration();

        account.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Bank account not found")))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_bank_accounts(
        &self,
        tenant_id: Uuid,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<BankAccount>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_bank_accounts"])
            .start_timer();

        let cursor = parse_page_token(page_token)?;
        let limit = page_size.clamp(1, 100) as i64;

        let query = format!(
            r#"
            SELECT {BANK_ACCOUNT_COLUMNS}
            FROM bank_accounts
            WHERE tenant_id = $1 AND ($2::uuid IS NULL OR bank_account_id > $2)
            ORDER BY bank_account_id
            LIMIT $3
            "#
        );

        let accounts = sqlx::query_as::<_, BankAccount>(&query)
            .bind(tenant_id)
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list bank accounts: {}", e)))?;

        timer.observe_duration();

        Ok(paginate(accounts, limit, |a| a.bank_account_id))
    }

    /// Mark an account inactive. Ingestion against it is refused afterwards.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, bank_account_id = %bank_account_id))]
    pub async fn deactivate_bank_account(
        &self,
        tenant_id: Uuid,
        bank_account_id: Uuid,
    ) -> Result<BankAccount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_bank_account"])
            .start_timer();

        let query = format!(
            r#"
            UPDATE bank_accounts
            SET status = $3, updated_utc = NOW()
            WHERE tenant_id = $1 AND bank_account_id = $2
            RETURNING {BANK_ACCOUNT_COLUMNS}
            "#
        );

        let account = sqlx::query_as::<_, BankAccount>(&query)
            .bind(tenant_id)
            .bind(bank_account_id)
            .bind(BankAccountStatus::Inactive.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate bank account: {}", e))
            })?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Bank account not found")))?;

        timer.observe_duration();
        info!("Bank account deactivated");

        Ok(account)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Insert a batch of provider transactions for one account.
    ///
    /// Runs in one database transaction with a savepoint per row: duplicates
    /// (`tenant_id, source_id`) are skipped, a failing row is rolled back on
    /// its own and reported, and the successful rows are committed together
    /// with the account's sync watermark. The account row is locked for
    /// update first, so batches for the same account run one after another.
    #[instrument(skip(self, rows), fields(tenant_id = %tenant_id, bank_account_id = %bank_account_id, rows = rows.len()))]
    pub async fn ingest_transactions(
        &self,
        tenant_id: Uuid,
        bank_account_id: Uuid,
        source: &str,
        rows: &[(usize, NewTransaction)],
        synced_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ingest_transactions"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to start transaction: {}", e))
        })?;

        let account = sqlx::query_as::<_, BankAccount>(&format!(
            "SELECT {BANK_ACCOUNT_COLUMNS} FROM bank_accounts WHERE tenant_id = $1 AND bank_account_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(bank_account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load bank account: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Bank account not found")))?;

        if !account.is_active() {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Bank account is not active"
            )));
        }

        let mut outcome = IngestOutcome::default();

        // A stable insert order keeps overlapping batches from waiting on
        // each other's unique-index entries in opposite orders.
        let mut ordered: Vec<&(usize, NewTransaction)> = rows.iter().collect();
        ordered.sort_by(|a, b| a.1.source_id.cmp(&b.1.source_id));

        for (index, row) in ordered {
            let mut savepoint = tx.begin().await.map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create savepoint: {}", e))
            })?;

            let inserted: Result<Option<Uuid>, sqlx::Error> = sqlx::query_scalar(
                r#"
                INSERT INTO transactions (transaction_id, tenant_id, bank_account_id, source_id, source, booking_date, value_date, amount, currency, description, counterparty_name, counterparty_iban, reference, status, allocated_amount, remaining_amount)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0, $8)
                ON CONFLICT (tenant_id, source_id) DO NOTHING
                RETURNING transaction_id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(bank_account_id)
            .bind(&row.source_id)
            .bind(source)
            .bind(row.booking_date)
            .bind(row.value_date)
            .bind(row.amount)
            .bind(&row.currency)
            .bind(&row.description)
            .bind(&row.counterparty_name)
            .bind(&row.counterparty_iban)
            .bind(&row.reference)
            .bind(row.status.as_str())
            .fetch_optional(&mut *savepoint)
            .await;

            match inserted {
                Ok(Some(transaction_id)) => {
                    savepoint.commit().await.map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!("Failed to release savepoint: {}", e))
                    })?;
                    outcome.inserted_ids.push(transaction_id);
                }
                Ok(None) => {
                    savepoint.commit().await.map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!("Failed to release savepoint: {}", e))
                    })?;
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(index = index, source_id = %row.source_id, error = %e, "Row insert failed");
                    savepoint.rollback().await.map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!("Failed to roll back savepoint: {}", e))
                    })?;
                    outcome.errors.push(RowError::new(
                        *index,
                        Some(row.source_id.clone()),
                        "Failed to store transaction",
                    ));
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE bank_accounts
            SET last_sync_at = GREATEST(COALESCE(last_sync_at, $3), $3), updated_utc = NOW()
            WHERE tenant_id = $1 AND bank_account_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(bank_account_id)
        .bind(synced_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update sync watermark: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit ingestion: {}", e))
        })?;

        timer.observe_duration();
        info!(
            inserted = outcome.inserted(),
            skipped = outcome.skipped,
            errors = outcome.errors.len(),
            "Ingestion batch committed"
        );

        Ok(outcome)
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    pub async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Transaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tenant_id = $1 AND transaction_id = $2"
        );

        let transaction = sqlx::query_as::<_, Transaction>(&query)
            .bind(tenant_id)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e)))?;

        timer.observe_duration();

        transaction.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_transactions(
        &self,
        tenant_id: Uuid,
        bank_account_id: Option<Uuid>,
        status: Option<TransactionStatus>,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<Transaction>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let cursor = parse_page_token(page_token)?;
        let limit = page_size.clamp(1, 100) as i64;

        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR bank_account_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::uuid IS NULL OR transaction_id > $4)
            ORDER BY transaction_id
            LIMIT $5
            "#
        );

        let transactions = sqlx::query_as::<_, Transaction>(&query)
            .bind(tenant_id)
            .bind(bank_account_id)
            .bind(status.map(|s| s.as_str()))
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e)))?;

        timer.observe_duration();

        Ok(paginate(transactions, limit, |t| t.transaction_id))
    }

    /// Apply a manual status change. Allocation is the only way to `matched`.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id, next = next.as_str()))]
    pub async fn transition_transaction_status(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        next: TransactionStatus,
    ) -> Result<Transaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_transaction_status"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to start transaction: {}", e))
        })?;

        let current = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tenant_id = $1 AND transaction_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load transaction: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;

        let status = TransactionStatus::from_str(&current.status);
        if !status.can_transition_to(next) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Cannot move transaction from {} to {}",
                status.as_str(),
                next.as_str()
            )));
        }
        if next == TransactionStatus::Ignored && !current.allocated_amount.is_zero() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Cannot ignore a partially allocated transaction"
            )));
        }

        let updated = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET status = $3, updated_utc = NOW()
            WHERE tenant_id = $1 AND transaction_id = $2
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update transaction status: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit status change: {}", e))
        })?;

        timer.observe_duration();
        info!(from = status.as_str(), "Transaction status changed");

        Ok(updated)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self, invoice), fields(tenant_id = %tenant_id, invoice_number = %invoice.invoice_number))]
    pub async fn create_invoice(
        &self,
        tenant_id: Uuid,
        invoice: &NewInvoice,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let status = settlement::derive_invoice_status(
            invoice.amount_incl_vat,
            Decimal::ZERO,
            invoice.due_date,
            Utc::now().date_naive(),
        );

        let query = format!(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, invoice_number, counterparty_name, issue_date, due_date, currency, amount_incl_vat, settled_amount, open_amount, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $8, $9)
            RETURNING {INVOICE_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, Invoice>(&query)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&invoice.invoice_number)
            .bind(&invoice.counterparty_name)
            .bind(invoice.issue_date)
            .bind(invoice.due_date)
            .bind(&invoice.currency)
            .bind(invoice.amount_incl_vat)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(anyhow::anyhow!(
                        "Invoice number {} already exists",
                        invoice.invoice_number
                    ))
                } else {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e))
                }
            })?;

        timer.observe_duration();
        info!(invoice_id = %created.invoice_id, status = status.as_str(), "Invoice created");

        Ok(created)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let query =
            format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2");

        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(tenant_id)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        invoice.ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_invoices(
        &self,
        tenant_id: Uuid,
        status: Option<InvoiceStatus>,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<Invoice>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let cursor = parse_page_token(page_token)?;
        let limit = page_size.clamp(1, 100) as i64;

        let query = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR invoice_id > $3)
            ORDER BY invoice_id
            LIMIT $4
            "#
        );

        let invoices = sqlx::query_as::<_, Invoice>(&query)
            .bind(tenant_id)
            .bind(status.map(|s| s.as_str()))
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(paginate(invoices, limit, |i| i.invoice_id))
    }

    /// Cancel an invoice that has not been settled at all.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn cancel_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to start transaction: {}", e))
        })?;

        let current = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load invoice: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

        if InvoiceStatus::from_str(&current.status) == InvoiceStatus::Cancelled {
            return Ok(current);
        }
        if !current.settled_amount.is_zero() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice has settled amount {} and cannot be cancelled",
                current.settled_amount
            )));
        }

        let cancelled = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = $3, updated_utc = NOW()
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(InvoiceStatus::Cancelled.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to cancel invoice: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit cancellation: {}", e))
        })?;

        timer.observe_duration();
        info!("Invoice cancelled");

        Ok(cancelled)
    }

    // =========================================================================
    // Matching
    // =========================================================================

    /// Apply allocations atomically.
    ///
    /// Every referenced transaction and invoice is locked in id order, the
    /// allocations are applied in request order on in-memory balances and
    /// the resulting rows plus one `Match` per allocation are written in the
    /// same database transaction.
    #[instrument(skip(self, allocations), fields(tenant_id = %tenant_id, matched_by = %matched_by, allocations = allocations.len()))]
    pub async fn apply_allocations(
        &self,
        tenant_id: Uuid,
        matched_by: &str,
        allocations: &[AllocationRequest],
    ) -> Result<AllocationOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_allocations"])
            .start_timer();

        let transaction_ids: Vec<Uuid> = allocations
            .iter()
            .map(|a| a.transaction_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let invoice_ids: Vec<Uuid> = allocations
            .iter()
            .map(|a| a.invoice_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to start transaction: {}", e))
        })?;

        let locked_transactions = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE tenant_id = $1 AND transaction_id = ANY($2)
            ORDER BY transaction_id
            FOR UPDATE
            "#
        ))
        .bind(tenant_id)
        .bind(&transaction_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock transactions: {}", e)))?;

        let locked_invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = ANY($2)
            ORDER BY invoice_id
            FOR UPDATE
            "#
        ))
        .bind(tenant_id)
        .bind(&invoice_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoices: {}", e)))?;

        let mut transactions: HashMap<Uuid, TransactionBalance> = locked_transactions
            .iter()
            .map(|t| (t.transaction_id, TransactionBalance::from(t)))
            .collect();
        let mut invoices: HashMap<Uuid, InvoiceBalance> = locked_invoices
            .iter()
            .map(|i| (i.invoice_id, InvoiceBalance::from(i)))
            .collect();

        let today = Utc::now().date_naive();
        let mut planned = Vec::with_capacity(allocations.len());

        for allocation in allocations {
            let txn = transactions.get_mut(&allocation.transaction_id).ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Transaction {} not found",
                    allocation.transaction_id
                ))
            })?;
            let invoice = invoices.get_mut(&allocation.invoice_id).ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", allocation.invoice_id))
            })?;

            let amount = settlement::allocate(txn, invoice, allocation.amount, today)?;
            planned.push((allocation.transaction_id, allocation.invoice_id, amount));
        }

        let mut outcome = AllocationOutcome::default();

        for id in &transaction_ids {
            let balance = &transactions[id];
            let updated = sqlx::query_as::<_, Transaction>(&format!(
                r#"
                UPDATE transactions
                SET allocated_amount = $3, remaining_amount = $4, status = $5, updated_utc = NOW()
                WHERE tenant_id = $1 AND transaction_id = $2
                RETURNING {TRANSACTION_COLUMNS}
                "#
            ))
            .bind(tenant_id)
            .bind(id)
            .bind(balance.allocated_amount)
            .bind(balance.remaining())
            .bind(balance.status.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update transaction: {}", e)))?;
            outcome.transactions.push(updated);
        }

        for id in &invoice_ids {
            let balance = &invoices[id];
            let updated = sqlx::query_as::<_, Invoice>(&format!(
                r#"
                UPDATE invoices
                SET settled_amount = $3, open_amount = $4, status = $5, updated_utc = NOW()
                WHERE tenant_id = $1 AND invoice_id = $2
                RETURNING {INVOICE_COLUMNS}
                "#
            ))
            .bind(tenant_id)
            .bind(id)
            .bind(balance.settled_amount)
            .bind(balance.open_amount())
            .bind(balance.status.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?;
            outcome.invoices.push(updated);
        }

        for (transaction_id, invoice_id, amount) in planned {
            let created = sqlx::query_as::<_, Match>(&format!(
                r#"
                INSERT INTO matches (match_id, tenant_id, transaction_id, invoice_id, matched_amount, matched_by)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {MATCH_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(transaction_id)
            .bind(invoice_id)
            .bind(amount)
            .bind(matched_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create match: {}", e)))?;
            outcome.matches.push(created);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit allocations: {}", e))
        })?;

        timer.observe_duration();
        info!(matches = outcome.matches.len(), "Allocations committed");

        Ok(outcome)
    }

    /// Matches of one transaction and/or one invoice, oldest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_matches(
        &self,
        tenant_id: Uuid,
        transaction_id: Option<Uuid>,
        invoice_id: Option<Uuid>,
    ) -> Result<Vec<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_matches"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {MATCH_COLUMNS}
            FROM matches
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR transaction_id = $2)
              AND ($3::uuid IS NULL OR invoice_id = $3)
            ORDER BY created_utc, match_id
            "#
        );

        let matches = sqlx::query_as::<_, Match>(&query)
            .bind(tenant_id)
            .bind(transaction_id)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list matches: {}", e)))?;

        timer.observe_duration();

        Ok(matches)
    }
}
