//! Application startup and lifecycle management.

use crate::config::ReconciliationConfig;
use crate::handlers::{
    bank_accounts, health_check, ingest, invoices, matches, metrics_endpoint, readiness_check,
    transactions,
};
use crate::services::events::{EventTopics, PubSubConfig};
use crate::services::metrics::http_metrics_middleware;
use crate::services::{init_metrics, Database, EventPublisher, LogPublisher, PubSubPublisher};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::auth::{auth_middleware, JwtVerifier};
use service_core::error::AppError;
use service_core::middleware::signature::{
    signature_validation_middleware, SignatureConfig, StaticSignatureStore,
};
use service_core::middleware::tracing::request_id_middleware;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ReconciliationConfig,
    pub db: Arc<Database>,
    pub publisher: Arc<dyn EventPublisher>,
    pub topics: EventTopics,
    pub jwt: Arc<JwtVerifier>,
    pub signatures: StaticSignatureStore,
}

/// Pub/Sub when a project is configured, otherwise log-only.
fn build_publisher(config: &ReconciliationConfig) -> Result<Arc<dyn EventPublisher>, AppError> {
    match &config.pubsub.project_id {
        Some(project_id) => {
            let publisher = PubSubPublisher::new(
                PubSubConfig {
                    endpoint: config.pubsub.endpoint.clone(),
                    project_id: project_id.clone(),
                    access_token: config.pubsub.access_token.clone(),
                    timeout: config.pubsub.timeout,
                },
                RetryConfig::default(),
            )?;
            tracing::info!(project_id = %project_id, "Publishing events to Pub/Sub");
            Ok(Arc::new(publisher))
        }
        None => {
            tracing::warn!("PUBSUB_PROJECT_ID not configured - events will only be logged");
            Ok(Arc::new(LogPublisher))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let ingest_routes = Router::new()
        .route(
            "/internal/transactions/ingest",
            post(ingest::ingest_transactions),
        )
        .route_layer(from_fn_with_state(
            state.signatures.clone(),
            signature_validation_middleware::<StaticSignatureStore>,
        ));

    let api_routes = Router::new()
        .route(
            "/api/bank-accounts",
            post(bank_accounts::create_bank_account).get(bank_accounts::list_bank_accounts),
        )
        .route("/api/bank-accounts/:id", get(bank_accounts::get_bank_account))
        .route(
            "/api/bank-accounts/:id/deactivate",
            post(bank_accounts::deactivate_bank_account),
        )
        .route(
            "/api/invoices",
            post(invoices::create_invoice).get(invoices::list_invoices),
        )
        .route("/api/invoices/:id", get(invoices::get_invoice))
        .route("/api/invoices/:id/cancel", post(invoices::cancel_invoice))
        .route("/api/transactions", get(transactions::list_transactions))
        .route("/api/transactions/:id", get(transactions::get_transaction))
        .route(
            "/api/transactions/:id/status",
            post(transactions::update_transaction_status),
        )
        .route(
            "/api/matches",
            post(matches::create_matches).get(matches::list_matches),
        )
        .route_layer(from_fn_with_state(state.jwt.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .merge(ingest_routes)
        .merge(api_routes)
        .with_state(state)
        .layer(from_fn(http_metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                    client_id = tracing::field::Empty,
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, false).await
    }

    /// Build the application with a caller-supplied event publisher.
    pub async fn build_with_publisher(
        config: ReconciliationConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, Some(publisher), true).await
    }

    async fn build_internal(
        config: ReconciliationConfig,
        publisher: Option<Arc<dyn EventPublisher>>,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let jwt = JwtVerifier::new(
            &config.auth.jwt_key,
            config.auth.issuer.as_deref(),
            config.auth.audience.as_deref(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize JWT verifier");
            AppError::ConfigError(e)
        })?;

        if config.ingestion.require_signatures && config.ingestion.clients.is_empty() {
            tracing::warn!("No ingestion clients configured - signed ingestion requests will be rejected");
        }
        let signatures = StaticSignatureStore::new(
            SignatureConfig {
                require_signatures: config.ingestion.require_signatures,
                excluded_paths: vec![],
                max_body_bytes: config.ingestion.max_body_bytes,
            },
            config.ingestion.clients.clone(),
        );

        let publisher = match publisher {
            Some(publisher) => publisher,
            None => build_publisher(&config)?,
        };

        let topics = EventTopics {
            transactions_imported: config.pubsub.transactions_imported_topic.clone(),
            transactions_matched: config.pubsub.transactions_matched_topic.clone(),
        };

        let state = AppState {
            config: config.clone(),
            db: Arc::new(db),
            publisher,
            topics,
            jwt: Arc::new(jwt),
            signatures,
        };

        let http_addr = config.common.http_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Reconciliation service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
