//! Invoice handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::WithRejection;
use rust_decimal::Decimal;
use service_core::auth::AuthUser;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{CreateInvoiceRequest, InvoiceResponse, ListInvoicesQuery, Page};
use crate::models::{InvoiceStatus, NewInvoice, MONEY_SCALE};
use crate::startup::AppState;

pub async fn create_invoice(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    WithRejection(Json(request), _): WithRejection<Json<CreateInvoiceRequest>, AppError>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    request.validate()?;

    if request.amount_incl_vat <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "amountInclVat must be positive"
        )));
    }
    if request.amount_incl_vat.normalize().scale() > MONEY_SCALE {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "amountInclVat has too many decimal places"
        )));
    }
    if request.due_date < request.issue_date {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "dueDate must not be before issueDate"
        )));
    }

    let invoice = NewInvoice {
        invoice_number: request.invoice_number.trim().to_string(),
        counterparty_name: request.counterparty_name.trim().to_string(),
        issue_date: request.issue_date,
        due_date: request.due_date,
        currency: request.currency.to_ascii_uppercase(),
        amount_incl_vat: request.amount_incl_vat,
    };

    let created = state.db.create_invoice(auth.tenant_id, &invoice).await?;

    Ok((StatusCode::CREATED, Json(InvoiceResponse::from(created))))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<Page<InvoiceResponse>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            InvoiceStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Unknown invoice status: {}", s)))
        })
        .transpose()?;

    let (invoices, next_page_token) = state
        .db
        .list_invoices(
            auth.tenant_id,
            status,
            query.page_size,
            query.page_token.as_deref(),
        )
        .await?;

    Ok(Json(Page {
        items: invoices.into_iter().map(InvoiceResponse::from).collect(),
        next_page_token,
    }))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state.db.get_invoice(auth.tenant_id, invoice_id).await?;
    Ok(Json(InvoiceResponse::from(invoice)))
}

/// Cancel an invoice that nothing has been allocated to yet.
pub async fn cancel_invoice(
    State(state): State<AppState>,
    AuthUser(auth): AuthUser,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state.db.cancel_invoice(auth.tenant_id, invoice_id).await?;
    Ok(Json(InvoiceResponse::from(invoice)))
}
