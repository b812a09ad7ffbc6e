//! Integration tests for signed transaction ingestion.

mod common;

use common::{provider_row, spawn_app, token_for, TestApp, INGEST_PATH};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

async fn imported_events_for(app: &TestApp, account_id: Uuid) -> Vec<Value> {
    // Publication is spawned after commit; give it a moment.
    for _ in 0..20 {
        let events: Vec<Value> = app
            .publisher
            .events()
            .into_iter()
            .filter(|(topic, event)| {
                topic == "transactions-imported" && event["accountId"] == account_id.to_string()
            })
            .map(|(_, event)| event)
            .collect();
        if !events.is_empty() {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn batch_with_one_duplicate_inserts_two() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let first = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": [provider_row("tx-a", "10.00")]
        }))
        .await;
    assert_eq!(first.status(), 200);

    let response = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "source": "tink",
            "transactions": [
                provider_row("tx-a", "10.00"),
                provider_row("tx-b", "-25.50"),
                provider_row("tx-c", "99.99")
            ]
        }))
        .await;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["inserted"], 2);
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["errors"], 0);
    assert!(body.get("errorDetails").is_none());
}

#[tokio::test]
async fn reingesting_the_same_batch_skips_everything() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let batch = json!({
        "tenantId": app.tenant_id,
        "accountId": account_id,
        "transactions": [provider_row("r-1", "1.00"), provider_row("r-2", "2.00")]
    });

    let first: Value = app.ingest(&batch).await.json().await.unwrap();
    assert_eq!(first["inserted"], 2);

    let second: Value = app.ingest(&batch).await.json().await.unwrap();
    assert_eq!(second["inserted"], 0);
    assert_eq!(second["skipped"], 2);

    let events = imported_events_for(&app, account_id).await;
    assert_eq!(events.len(), 1, "only the batch with new rows publishes");
    assert_eq!(events[0]["transactionIds"].as_array().unwrap().len(), 2);
    assert_eq!(events[0]["tenantId"], app.tenant_id.to_string());
}

#[tokio::test]
async fn duplicate_within_one_batch_is_skipped() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let body: Value = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": [provider_row("same", "5.00"), provider_row("same", "5.00")]
        }))
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(body["inserted"], 1);
    assert_eq!(body["skipped"], 1);
}

#[tokio::test]
async fn malformed_rows_are_reported_without_failing_the_batch() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let response = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": [
                provider_row("ok-1", "3.00"),
                {"externalId": "broken", "amount": "1.00", "currency": "EUR"},
                provider_row("ok-2", "4.00")
            ]
        }))
        .await;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["inserted"], 2);
    assert_eq!(body["errors"], 1);
    assert_eq!(body["errorDetails"][0]["index"], 1);
    assert_eq!(body["errorDetails"][0]["externalId"], "broken");
}

#[tokio::test]
async fn other_tenants_account_is_not_found() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;
    let intruder = Uuid::new_v4();

    let response = app
        .ingest(&json!({
            "tenantId": intruder,
            "accountId": account_id,
            "transactions": [provider_row("steal-1", "100.00")]
        }))
        .await;
    assert_eq!(response.status(), 404);

    let owner_view: Value = app
        .get(
            &format!("/api/transactions?accountId={}", account_id),
            &app.member_token(),
        )
        .await
        .json()
        .await
        .unwrap();
    assert!(owner_view["items"].as_array().unwrap().is_empty());

    let intruder_view: Value = app
        .get("/api/transactions", &token_for(intruder, "x", "admin"))
        .await
        .json()
        .await
        .unwrap();
    assert!(intruder_view["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn inactive_account_is_forbidden() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let response = app
        .post_json(
            &format!("/api/bank-accounts/{}/deactivate", account_id),
            &app.admin_token(),
            &json!({}),
        )
        .await;
    assert_eq!(response.status(), 200);

    let response = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": [provider_row("late", "1.00")]
        }))
        .await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn invalid_envelope_is_rejected() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .ingest(&json!({
            "tenantId": "not-a-uuid",
            "accountId": Uuid::new_v4(),
            "transactions": []
        }))
        .await;
    assert_eq!(response.status(), 400);

    let response = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": Uuid::new_v4(),
            "transactions": "nope"
        }))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let rows: Vec<Value> = (0..1001)
        .map(|i| provider_row(&format!("bulk-{}", i), "1.00"))
        .collect();
    let response = app
        .ingest(&json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": rows
        }))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unsigned_request_is_rejected() {
    let Some(app) = spawn_app().await else { return };

    let response = app
        .client
        .post(app.url(INGEST_PATH))
        .json(&json!({
            "tenantId": app.tenant_id,
            "accountId": Uuid::new_v4(),
            "transactions": []
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn sync_watermark_only_moves_forward() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    for synced_at in ["2026-03-10T12:00:00Z", "2026-03-01T08:00:00Z"] {
        let response = app
            .ingest(&json!({
                "tenantId": app.tenant_id,
                "accountId": account_id,
                "syncedAt": synced_at,
                "transactions": []
            }))
            .await;
        assert_eq!(response.status(), 200);
    }

    let account: Value = app
        .get(
            &format!("/api/bank-accounts/{}", account_id),
            &app.member_token(),
        )
        .await
        .json()
        .await
        .unwrap();
    let last_sync: chrono::DateTime<chrono::Utc> =
        account["lastSyncAt"].as_str().unwrap().parse().unwrap();
    assert_eq!(last_sync.to_rfc3339(), "2026-03-10T12:00:00+00:00");
}

#[tokio::test]
async fn pending_rows_are_not_matchable_yet() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    let mut row = provider_row("pend-1", "12.00");
    row["status"] = json!("pending");
    app.ingest(&json!({
        "tenantId": app.tenant_id,
        "accountId": account_id,
        "transactions": [row]
    }))
    .await;

    let page: Value = app
        .get("/api/transactions?status=pending", &app.member_token())
        .await
        .json()
        .await
        .unwrap();
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["remainingAmount"], "12.0000");
    assert_eq!(items[0]["allocatedAmount"], "0.0000");
}

#[tokio::test]
async fn concurrent_batches_for_one_account_serialize() {
    let Some(app) = spawn_app().await else { return };
    let account_id = app.create_account().await;

    for round in 0..5 {
        let batch = json!({
            "tenantId": app.tenant_id,
            "accountId": account_id,
            "transactions": (0..20)
                .map(|i| provider_row(&format!("race-{}-{}", round, i), "1.00"))
                .collect::<Vec<_>>()
        });

        let (a, b, c, d) = tokio::join!(
            app.ingest(&batch),
            app.ingest(&batch),
            app.ingest(&batch),
            app.ingest(&batch)
        );

        let mut inserted = 0;
        for response in [a, b, c, d] {
            assert_eq!(response.status(), 200);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["errors"], 0);
            assert_eq!(
                body["inserted"].as_u64().unwrap() + body["skipped"].as_u64().unwrap(),
                20
            );
            inserted += body["inserted"].as_u64().unwrap();
        }
        assert_eq!(inserted, 20, "each row is stored exactly once");
    }

    let page: Value = app
        .get(
            &format!("/api/transactions?accountId={}&pageSize=100", account_id),
            &app.member_token(),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 100);
}
