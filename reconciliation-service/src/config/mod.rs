//! Configuration module for reconciliation-service.

use secrecy::Secret;
use service_core::auth::JwtKey;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::middleware::signature::DEFAULT_MAX_BODY_BYTES;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub ingestion: IngestionConfig,
    pub pubsub: PubSubSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_key: JwtKey,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Signed service-to-service access to the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub require_signatures: bool,
    pub clients: HashMap<String, Secret<String>>,
    pub max_batch_size: usize,
    /// Request bodies above this size are refused before verification.
    pub max_body_bytes: usize,
}

/// Pub/Sub settings. Without a project id events are only logged.
#[derive(Debug, Clone)]
pub struct PubSubSettings {
    pub project_id: Option<String>,
    pub endpoint: String,
    pub access_token: Option<Secret<String>>,
    pub timeout: Duration,
    pub transactions_imported_topic: String,
    pub transactions_matched_topic: String,
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let jwt_key = match (env::var("JWT_PUBLIC_KEY_PATH"), env::var("JWT_SECRET")) {
            (Ok(path), _) => JwtKey::RsaPublicKeyPath(path),
            (Err(_), Ok(secret)) => JwtKey::Secret(secret),
            _ => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SECRET or JWT_PUBLIC_KEY_PATH is required"
                )))
            }
        };

        let mut clients = HashMap::new();
        if let (Ok(id), Ok(secret)) = (env::var("INGEST_CLIENT_ID"), env::var("INGEST_CLIENT_SECRET"))
        {
            clients.insert(id, Secret::new(secret));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            auth: AuthConfig {
                jwt_key,
                issuer: env::var("JWT_ISSUER").ok(),
                audience: env::var("JWT_AUDIENCE").ok(),
            },
            ingestion: IngestionConfig {
                require_signatures: env::var("INGEST_REQUIRE_SIGNATURES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(true),
                clients,
                max_batch_size: env::var("INGEST_MAX_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
                max_body_bytes: env::var("INGEST_MAX_BODY_BYTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_BODY_BYTES),
            },
            pubsub: PubSubSettings {
                project_id: env::var("PUBSUB_PROJECT_ID").ok(),
                endpoint: env::var("PUBSUB_ENDPOINT")
                    .unwrap_or_else(|_| "https://pubsub.googleapis.com".to_string()),
                access_token: env::var("PUBSUB_ACCESS_TOKEN").ok().map(Secret::new),
                timeout: Duration::from_secs(
                    env::var("PUBSUB_TIMEOUT_SECS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(10),
                ),
                transactions_imported_topic: env::var("TOPIC_TRANSACTIONS_IMPORTED")
                    .unwrap_or_else(|_| "transactions-imported".to_string()),
                transactions_matched_topic: env::var("TOPIC_TRANSACTIONS_MATCHED")
                    .unwrap_or_else(|_| "transactions-matched".to_string()),
            },
        })
    }
}
