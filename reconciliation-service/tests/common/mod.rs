//! Common test utilities for reconciliation-service integration tests.

#![allow(dead_code)]

use jsonwebtoken::{encode, EncodingKey, Header};
use reconciliation_service::config::{
    AuthConfig, DatabaseConfig, IngestionConfig, PubSubSettings, ReconciliationConfig,
};
use reconciliation_service::services::RecordingPublisher;
use reconciliation_service::startup::Application;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::auth::JwtKey;
use service_core::config::Config as CommonConfig;
use service_core::utils::signature::sign_request;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-jwt-secret";
pub const INGEST_CLIENT_ID: &str = "sync-worker";
pub const INGEST_CLIENT_SECRET: &str = "integration-test-ingest-secret";
pub const INGEST_PATH: &str = "/internal/transactions/ingest";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config(database_url: String) -> ReconciliationConfig {
    let mut clients = HashMap::new();
    clients.insert(
        INGEST_CLIENT_ID.to_string(),
        Secret::new(INGEST_CLIENT_SECRET.to_string()),
    );

    ReconciliationConfig {
        common: CommonConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        },
        service_name: "reconciliation-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new(database_url),
            max_connections: 5,
            min_connections: 1,
        },
        auth: AuthConfig {
            jwt_key: JwtKey::Secret(JWT_SECRET.to_string()),
            issuer: None,
            audience: None,
        },
        ingestion: IngestionConfig {
            require_signatures: true,
            clients,
            max_batch_size: 1000,
            max_body_bytes: 2 * 1024 * 1024,
        },
        pubsub: PubSubSettings {
            project_id: None,
            endpoint: "http://127.0.0.1:1".to_string(),
            access_token: None,
            timeout: Duration::from_secs(1),
            transactions_imported_topic: "transactions-imported".to_string(),
            transactions_matched_topic: "transactions-matched".to_string(),
        },
    }
}

/// Test application wrapper.
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub tenant_id: Uuid,
    pub publisher: Arc<RecordingPublisher>,
}

/// Spawn the application against `TEST_DATABASE_URL`.
///
/// Returns `None` when no database is configured so the suite can run
/// without Postgres.
pub async fn spawn_app() -> Option<TestApp> {
    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set - skipping integration test");
        return None;
    };

    init_tracing();

    let publisher = Arc::new(RecordingPublisher::new());
    let app = Application::build_with_publisher(test_config(database_url), publisher.clone())
        .await
        .expect("Failed to build application");

    let address = format!("http://127.0.0.1:{}", app.http_port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();

    // Wait for server to be ready with retry
    let mut attempts = 0;
    loop {
        match client.get(format!("{}/health", address)).send().await {
            Ok(_) => break,
            Err(_) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("Server did not come up after 20 attempts: {}", e),
        }
    }

    Some(TestApp {
        address,
        client,
        tenant_id: Uuid::new_v4(),
        publisher,
    })
}

/// Sign a bearer token for a tenant.
pub fn token_for(tenant_id: Uuid, user_id: &str, role: &str) -> String {
    let claims = json!({
        "sub": user_id,
        "tenant_id": tenant_id.to_string(),
        "role": role,
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("Failed to encode token")
}

/// One provider row in the shape the sync worker sends.
pub fn provider_row(external_id: &str, amount: &str) -> Value {
    json!({
        "externalId": external_id,
        "bookingDate": "2026-03-02",
        "amount": amount,
        "currency": "EUR",
        "description": "Payment",
        "status": "booked"
    })
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn admin_token(&self) -> String {
        token_for(self.tenant_id, "admin-user", "admin")
    }

    pub fn member_token(&self) -> String {
        token_for(self.tenant_id, "member-user", "member")
    }

    pub async fn post_json(&self, path: &str, token: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Send a correctly signed ingestion request.
    pub async fn ingest(&self, body: &Value) -> reqwest::Response {
        let raw = body.to_string();
        let signed = sign_request(INGEST_CLIENT_ID, INGEST_CLIENT_SECRET, "POST", INGEST_PATH, &raw)
            .expect("Failed to sign request");

        let mut request = self
            .client
            .post(self.url(INGEST_PATH))
            .header("content-type", "application/json")
            .body(raw);
        for (name, value) in signed.pairs() {
            request = request.header(name, value);
        }

        request.send().await.expect("Failed to execute request")
    }

    /// Register an active EUR account for this tenant and return its id.
    pub async fn create_account(&self) -> Uuid {
        let response = self
            .post_json(
                "/api/bank-accounts",
                &self.admin_token(),
                &json!({
                    "provider": "tink",
                    "providerAccountId": Uuid::new_v4().to_string(),
                    "name": "Operating account",
                    "currency": "EUR"
                }),
            )
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.expect("Invalid JSON");
        body["id"].as_str().unwrap().parse().unwrap()
    }

    /// Create an EUR invoice due in the future and return its id.
    pub async fn create_invoice(&self, amount: &str) -> Uuid {
        let response = self
            .post_json(
                "/api/invoices",
                &self.member_token(),
                &json!({
                    "invoiceNumber": format!("INV-{}", Uuid::new_v4()),
                    "counterpartyName": "Acme B.V.",
                    "issueDate": "2026-03-01",
                    "dueDate": "2099-12-31",
                    "currency": "EUR",
                    "amountInclVat": amount
                }),
            )
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.expect("Invalid JSON");
        body["id"].as_str().unwrap().parse().unwrap()
    }

    /// Ingest one booked row and return the new transaction id.
    pub async fn ingest_one(&self, account_id: Uuid, amount: &str) -> Uuid {
        let external_id = format!("ext-{}", Uuid::new_v4());
        let response = self
            .ingest(&json!({
                "tenantId": self.tenant_id,
                "accountId": account_id,
                "transactions": [provider_row(&external_id, amount)]
            }))
            .await;
        assert_eq!(response.status(), 200);

        let page: Value = self
            .get(
                &format!("/api/transactions?accountId={}&pageSize=100", account_id),
                &self.member_token(),
            )
            .await
            .json()
            .await
            .expect("Invalid JSON");

        page["items"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["externalId"] == external_id.as_str())
            .and_then(|t| t["id"].as_str())
            .unwrap()
            .parse()
            .unwrap()
    }
}
