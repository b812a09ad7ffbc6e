//! Signed service-to-service ingestion of provider transactions.

use axum::{extract::State, Extension, Json};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::tracing::RequestId;

use crate::dtos::{IngestTransactionsRequest, IngestTransactionsResponse};
use crate::services::events::{spawn_publish, TransactionsImported};
use crate::services::ingest::parse_row;
use crate::services::metrics::record_ingestion;
use crate::startup::AppState;

const DEFAULT_SOURCE: &str = "bank_sync";
const MAX_SOURCE_LEN: usize = 64;

#[tracing::instrument(
    skip(state, request_id, payload),
    fields(tenant_id = %payload.tenant_id, account_id = %payload.account_id, rows = payload.transactions.len())
)]
pub async fn ingest_transactions(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    WithRejection(Json(payload), _): WithRejection<Json<IngestTransactionsRequest>, AppError>,
) -> Result<Json<IngestTransactionsResponse>, AppError> {
    let max_batch = state.config.ingestion.max_batch_size;
    if payload.transactions.len() > max_batch {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Batch of {} transactions exceeds the limit of {}",
            payload.transactions.len(),
            max_batch
        )));
    }

    let source = payload
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SOURCE)
        .to_string();
    if source.len() > MAX_SOURCE_LEN {
        return Err(AppError::BadRequest(anyhow::anyhow!("source is too long")));
    }

    let mut rows = Vec::with_capacity(payload.transactions.len());
    let mut row_errors = Vec::new();
    for (index, raw) in payload.transactions.iter().enumerate() {
        match parse_row(index, raw) {
            Ok(row) => rows.push((index, row)),
            Err(e) => row_errors.push(e),
        }
    }

    let outcome = state
        .db
        .ingest_transactions(
            payload.tenant_id,
            payload.account_id,
            &source,
            &rows,
            payload.synced_at.unwrap_or_else(Utc::now),
        )
        .await?;

    row_errors.extend(outcome.errors.iter().cloned());
    row_errors.sort_by_key(|e| e.index);

    record_ingestion(&source, outcome.inserted(), outcome.skipped, row_errors.len());

    if !outcome.inserted_ids.is_empty() {
        let event = TransactionsImported {
            tenant_id: payload.tenant_id,
            account_id: payload.account_id,
            source: source.clone(),
            transaction_ids: outcome.inserted_ids.clone(),
            imported_at: Utc::now(),
        };
        spawn_publish(
            state.publisher.clone(),
            state.topics.transactions_imported.clone(),
            &event,
            request_id.map(|Extension(RequestId(id))| id),
        );
    }

    tracing::info!(
        inserted = outcome.inserted(),
        skipped = outcome.skipped,
        errors = row_errors.len(),
        "Transactions ingested"
    );

    Ok(Json(IngestTransactionsResponse {
        success: true,
        inserted: outcome.inserted(),
        skipped: outcome.skipped,
        errors: row_errors.len(),
        error_details: row_errors,
    }))
}
