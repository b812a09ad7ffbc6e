//! Matching transactions against invoices.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Extension, Json,
};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use service_core::auth::AuthUser;
use service_core::error::AppError;
use service_core::middleware::tracing::RequestId;
use validator::Validate;

use crate::dtos::{
    CreateMatchesRequest, CreateMatchesResponse, InvoiceResponse, ListMatchesQuery, MatchResponse,
    TransactionResponse,
};
use crate::models::AllocationRequest;
use crate::services::events::{spawn_publish, TransactionsMatched};
use crate::services::metrics::record_allocation;
use crate::startup::AppState;

#[tracing::instrument(skip(state, auth, request_id, request), fields(tenant_id = %auth.tenant_id, user_id = %auth.user_id))]
pub async fn create_matches(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    request_id: Option<Extension<RequestId>>,
    WithRejection(Json(request), _): WithRejection<Json<CreateMatchesRequest>, AppError>,
) -> Result<(StatusCode, Json<CreateMatchesResponse>), AppError> {
    request.validate()?;

    let allocations: Vec<AllocationRequest> = request
        .allocations
        .into_iter()
        .map(|a| AllocationRequest {
            transaction_id: a.transaction_id,
            invoice_id: a.invoice_id,
            amount: a.amount,
        })
        .collect();

    let outcome = match state
        .db
        .apply_allocations(auth.tenant_id, &auth.user_id, &allocations)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            record_allocation("rejected");
            return Err(e);
        }
    };

    for _ in &outcome.matches {
        record_allocation("applied");
    }

    let event = TransactionsMatched {
        tenant_id: auth.tenant_id,
        matched_by: auth.user_id.clone(),
        match_ids: outcome.matches.iter().map(|m| m.match_id).collect(),
        transaction_ids: outcome.transactions.iter().map(|t| t.transaction_id).collect(),
        invoice_ids: outcome.invoices.iter().map(|i| i.invoice_id).collect(),
        paid_invoice_ids: outcome.paid_invoice_ids(),
        matched_at: Utc::now(),
    };
    spawn_publish(
        state.publisher.clone(),
        state.topics.transactions_matched.clone(),
        &event,
        request_id.map(|Extension(RequestId(id))| id),
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateMatchesResponse {
            matches: outcome.matches.into_iter().map(MatchResponse::from).collect(),
            transactions: outcome
                .transactions
                .into_iter()
                .map(TransactionResponse::from)
                .collect(),
            invoices: outcome.invoices.into_iter().map(InvoiceResponse::from).collect(),
        }),
    ))
}

pub async fn list_matches(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Query(query): Query<ListMatchesQuery>,
) -> Result<Json<Vec<MatchResponse>>, AppError> {
    if query.transaction_id.is_none() && query.invoice_id.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "transactionId or invoiceId is required"
        )));
    }

    let matches = state
        .db
        .list_matches(auth.tenant_id, query.transaction_id, query.invoice_id)
        .await?;

    Ok(Json(matches.into_iter().map(MatchResponse::from).collect()))
}
