//! Integration tests for operational endpoints.

mod common;

use common::spawn_app;

#[tokio::test]
async fn health_check_works() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("x-request-id"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["service"], "reconciliation-service");
}

#[tokio::test]
async fn readiness_checks_database() {
    let Some(app) = spawn_app().await else { return };

    let response = app.client.get(app.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn metrics_are_exposed() {
    let Some(app) = spawn_app().await else { return };

    // Generate at least one labelled sample.
    app.client.get(app.url("/health")).send().await.unwrap();

    let response = app.client.get(app.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("reconciliation_http_requests_total"));
}

#[tokio::test]
async fn api_requires_bearer_token() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .client
        .get(app.url("/api/invoices"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = app.get("/api/invoices", "not-a-jwt").await;
    assert_eq!(response.status(), 401);
}
