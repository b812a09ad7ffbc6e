//! Integration tests for invoice operations.

mod common;

use common::spawn_app;
use serde_json::{json, Value};
use uuid::Uuid;

fn invoice_body(number: &str, due_date: &str, amount: &str) -> Value {
    json!({
        "invoiceNumber": number,
        "counterpartyName": "Initech",
        "issueDate": "2026-01-01",
        "dueDate": due_date,
        "currency": "EUR",
        "amountInclVat": amount
    })
}

#[tokio::test]
async fn create_invoice_success() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .post_json(
            "/api/invoices",
            &app.member_token(),
            &invoice_body("INV-001", "2099-01-31", "121.00"),
        )
        .await;

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "unpaid");
    assert_eq!(body["amountInclVat"], "121.0000");
    assert_eq!(body["openAmount"], "121.0000");
    assert_eq!(body["settledAmount"], "0.0000");
}

#[tokio::test]
async fn past_due_invoice_starts_overdue() {
    let Some(app) = spawn_app().await else { return };

    let body: Value = app
        .post_json(
            "/api/invoices",
            &app.member_token(),
            &invoice_body("INV-OLD", "2020-01-31", "10.00"),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "overdue");

    let page: Value = app
        .get("/api/invoices?status=overdue", &app.member_token())
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_invoices_are_rejected() {
    let Some(app) = spawn_app().await else { return };
    let token = app.member_token();

    let zero = app
        .post_json("/api/invoices", &token, &invoice_body("Z-1", "2099-01-01", "0"))
        .await;
    assert_eq!(zero.status(), 400);

    let precise = app
        .post_json("/api/invoices", &token, &invoice_body("P-1", "2099-01-01", "1.00001"))
        .await;
    assert_eq!(precise.status(), 400);

    let mut backwards = invoice_body("B-1", "2025-12-01", "1.00");
    backwards["issueDate"] = json!("2026-01-01");
    let backwards = app.post_json("/api/invoices", &token, &backwards).await;
    assert_eq!(backwards.status(), 400);
}

#[tokio::test]
async fn duplicate_invoice_number_conflicts() {
    let Some(app) = spawn_app().await else { return };
    let body = invoice_body("INV-DUP", "2099-01-31", "10.00");

    let first = app.post_json("/api/invoices", &app.member_token(), &body).await;
    assert_eq!(first.status(), 201);
    let second = app.post_json("/api/invoices", &app.member_token(), &body).await;
    assert_eq!(second.status(), 409);
}

#[tokio::test]
async fn cancel_unsettled_invoice() {
    let Some(app) = spawn_app().await else { return };
    let invoice_id = app.create_invoice("10.00").await;

    let response = app
        .post_json(
            &format!("/api/invoices/{}/cancel", invoice_id),
            &app.member_token(),
            &json!({}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn settled_invoice_cannot_be_cancelled() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;
    let transaction_id = app.ingest_one(account_id, "5.00").await;
    let invoice_id = app.create_invoice("10.00").await;

    let matched = app
        .post_json(
            "/api/matches",
            &app.member_token(),
            &json!({ "allocations": [{ "transactionId": transaction_id, "invoiceId": invoice_id }] }),
        )
        .await;
    assert_eq!(matched.status(), 201);

    let response = app
        .post_json(
            &format!("/api/invoices/{}/cancel", invoice_id),
            &app.member_token(),
            &json!({}),
        )
        .await;
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .get(&format!("/api/invoices/{}", Uuid::new_v4()), &app.member_token())
        .await;
    assert_eq!(response.status(), 404);
}
