//! Transaction queries and manual status changes.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use axum_extra::extract::WithRejection;
use service_core::auth::AuthUser;
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{
    ListTransactionsQuery, MatchResponse, Page, TransactionDetailResponse, TransactionResponse,
    UpdateTransactionStatusRequest,
};
use crate::models::TransactionStatus;
use crate::startup::AppState;

fn parse_status(value: &str) -> Result<TransactionStatus, AppError> {
    TransactionStatus::parse(value).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Unknown transaction status: {}", value))
    })
}

pub async fn list_transactions(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<Page<TransactionResponse>>, AppError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;

    let (transactions, next_page_token) = state
        .db
        .list_transactions(
            auth.tenant_id,
            query.account_id,
            status,
            query.page_size,
            query.page_token.as_deref(),
        )
        .await?;

    Ok(Json(Page {
        items: transactions
            .into_iter()
            .map(TransactionResponse::from)
            .collect(),
        next_page_token,
    }))
}

/// A transaction together with the matches that settled it.
pub async fn get_transaction(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<TransactionDetailResponse>, AppError> {
    let transaction = state
        .db
        .get_transaction(auth.tenant_id, transaction_id)
        .await?;
    let matches = state
        .db
        .list_matches(auth.tenant_id, Some(transaction_id), None)
        .await?;

    Ok(Json(TransactionDetailResponse {
        transaction: TransactionResponse::from(transaction),
        matches: matches.into_iter().map(MatchResponse::from).collect(),
    }))
}

pub async fn update_transaction_status(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(transaction_id): Path<Uuid>,
    WithRejection(Json(request), _): WithRejection<Json<UpdateTransactionStatusRequest>, AppError>,
) -> Result<Json<TransactionResponse>, AppError> {
    let next = parse_status(&request.status)?;

    tracing::info!(
        transaction_id = %transaction_id,
        tenant_id = %auth.tenant_id,
        user_id = %auth.user_id,
        next = next.as_str(),
        "Updating transaction status"
    );

    let updated = state
        .db
        .transition_transaction_status(auth.tenant_id, transaction_id, next)
        .await?;

    Ok(Json(TransactionResponse::from(updated)))
}
