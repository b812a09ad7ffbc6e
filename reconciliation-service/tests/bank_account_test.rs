//! Integration tests for bank account operations.

mod common;

use common::{spawn_app, token_for};
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn register_bank_account_success() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .post_json(
            "/api/bank-accounts",
            &app.admin_token(),
            &json!({
                "provider": "tink",
                "providerAccountId": "acc-123",
                "name": "Main account",
                "iban": "nl91 abna 0417 1643 00",
                "currency": "eur"
            }),
        )
        .await;

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "active");
    assert_eq!(body["currency"], "EUR");
    assert_eq!(body["iban"], "NL91ABNA0417164300");
    assert!(body["lastSyncAt"].is_null());
}

#[tokio::test]
async fn duplicate_provider_account_conflicts() {
    let Some(app) = spawn_app().await else { return };

    let request = json!({
        "provider": "tink",
        "providerAccountId": "dup-1",
        "name": "Account",
        "currency": "EUR"
    });

    let first = app
        .post_json("/api/bank-accounts", &app.admin_token(), &request)
        .await;
    assert_eq!(first.status(), 201);

    let second = app
        .post_json("/api/bank-accounts", &app.admin_token(), &request)
        .await;
    assert_eq!(second.status(), 409);
}

#[tokio::test]
async fn members_cannot_register_accounts() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .post_json(
            "/api/bank-accounts",
            &app.member_token(),
            &json!({
                "provider": "tink",
                "providerAccountId": "acc-x",
                "name": "Account",
                "currency": "EUR"
            }),
        )
        .await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn invalid_currency_is_rejected() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .post_json(
            "/api/bank-accounts",
            &app.admin_token(),
            &json!({
                "provider": "tink",
                "providerAccountId": "acc-y",
                "name": "Account",
                "currency": "EURO"
            }),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn list_bank_accounts_paginates() {
    let Some(app) = spawn_app().await else { return };
    for _ in 0..3 {
        app.create_account().await;
    }

    let first: Value = app
        .get("/api/bank-accounts?pageSize=2", &app.member_token())
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["items"].as_array().unwrap().len(), 2);
    let token = first["nextPageToken"].as_str().unwrap().to_string();

    let second: Value = app
        .get(
            &format!("/api/bank-accounts?pageSize=2&pageToken={}", token),
            &app.member_token(),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(second["items"].as_array().unwrap().len(), 1);
    assert!(second["nextPageToken"].is_null());
}

#[tokio::test]
async fn bank_accounts_are_tenant_scoped() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let response = app
        .get(
            &format!("/api/bank-accounts/{}", account_id),
            &token_for(Uuid::new_v4(), "other", "admin"),
        )
        .await;
    assert_eq!(response.status(), 404);
}
