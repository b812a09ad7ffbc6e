//! Bank account registration and lifecycle.
//!
//! All operations are scoped to the caller's tenant.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::WithRejection;
use service_core::auth::{AuthUser, Role};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{BankAccountResponse, CreateBankAccountRequest, Page, PageQuery};
use crate::models::NewBankAccount;
use crate::startup::AppState;

/// Register an account after a provider connection completes. Admin only.
pub async fn create_bank_account(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    WithRejection(Json(request), _): WithRejection<Json<CreateBankAccountRequest>, AppError>,
) -> Result<(StatusCode, Json<BankAccountResponse>), AppError> {
    auth.require_role(Role::Admin)?;
    request.validate()?;

    let account = NewBankAccount {
        provider: request.provider.trim().to_string(),
        provider_account_id: request.provider_account_id.trim().to_string(),
        name: request.name.trim().to_string(),
        iban: request
            .iban
            .map(|iban| iban.replace(' ', "").to_ascii_uppercase())
            .filter(|iban| !iban.is_empty()),
        currency: request.currency.to_ascii_uppercase(),
    };

    let created = state.db.create_bank_account(auth.tenant_id, &account).await?;

    Ok((StatusCode::CREATED, Json(BankAccountResponse::from(created))))
}

pub async fn list_bank_accounts(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<BankAccountResponse>>, AppError> {
    let (accounts, next_page_token) = state
        .db
        .list_bank_accounts(auth.tenant_id, query.page_size, query.page_token.as_deref())
        .await?;

    Ok(Json(Page {
        items: accounts.into_iter().map(BankAccountResponse::from).collect(),
        next_page_token,
    }))
}

pub async fn get_bank_account(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(bank_account_id): Path<Uuid>,
) -> Result<Json<BankAccountResponse>, AppError> {
    let account = state
        .db
        .get_bank_account(auth.tenant_id, bank_account_id)
        .await?;

    Ok(Json(BankAccountResponse::from(account)))
}

/// Stop accepting ingestion for an account. Admin only.
pub async fn deactivate_bank_account(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(bank_account_id): Path<Uuid>,
) -> Result<Json<BankAccountResponse>, AppError> {
    auth.require_role(Role::Admin)?;

    tracing::info!(
        bank_account_id = %bank_account_id,
        tenant_id = %auth.tenant_id,
        user_id = %auth.user_id,
        "Deactivating bank account"
    );

    let account = state
        .db
        .deactivate_bank_account(auth.tenant_id, bank_account_id)
        .await?;

    Ok(Json(BankAccountResponse::from(account)))
}
