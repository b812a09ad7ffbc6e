//! HMAC request signatures for service-to-service endpoints.
//!
//! Callers sign `method|path|timestamp|nonce|sha256(body)` with a shared
//! secret and send it in `X-Client-ID`, `X-Timestamp`, `X-Nonce` and
//! `X-Signature` headers (or the equivalent query parameters).

use crate::error::AppError;
use crate::utils::signature::verify_signature;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use http_body_util::LengthLimitError;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum clock skew accepted between signer and verifier, in seconds.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 60;

/// Largest body buffered for verification unless configured otherwise.
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SignatureConfig {
    pub require_signatures: bool,
    pub excluded_paths: Vec<String>,
    /// Bodies above this size are rejected before the signature is checked.
    pub max_body_bytes: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            excluded_paths: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

/// Signature state backed by statically configured clients and an
/// in-process nonce cache.
#[derive(Clone)]
pub struct StaticSignatureStore {
    config: SignatureConfig,
    clients: Arc<HashMap<String, Secret<String>>>,
    nonces: Arc<DashMap<String, i64>>,
}

impl StaticSignatureStore {
    pub fn new(config: SignatureConfig, clients: HashMap<String, Secret<String>>) -> Self {
        Self {
            config,
            clients: Arc::new(clients),
            nonces: Arc::new(DashMap::new()),
        }
    }

    fn purge_expired(&self, now: i64) {
        self.nonces.retain(|_, expires_at| *expires_at > now);
    }
}

impl AsRef<SignatureConfig> for StaticSignatureStore {
    fn as_ref(&self) -> &SignatureConfig {
        &self.config
    }
}

#[async_trait]
impl SignatureStore for StaticSignatureStore {
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError> {
        let now = chrono::Utc::now().timestamp();
        self.purge_expired(now);

        // A nonce only has to outlive the timestamp window on both sides.
        let expires_at = now + 2 * MAX_TIMESTAMP_SKEW_SECS;
        match self.nonces.entry(nonce.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .clients
            .get(client_id)
            .map(|secret| secret.expose_secret().clone()))
    }
}

#[derive(Deserialize)]
struct SignatureQuery {
    client_id: Option<String>,
    timestamp: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();
    let path = req.uri().path();

    if config
        .excluded_paths
        .iter()
        .any(|p| path == p || path.starts_with(p))
    {
        return Ok(next.run(req).await);
    }

    if !config.require_signatures {
        let has_header = req.headers().contains_key("X-Signature");
        let has_query = req
            .uri()
            .query()
            .map(|q| q.contains("signature="))
            .unwrap_or(false);
        if !has_header && !has_query {
            return Ok(next.run(req).await);
        }
    }

    let (client_id, timestamp_str, nonce, signature) = extract_auth_data(&req)?;

    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid timestamp format")))?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Request timestamp expired"
        )));
    }

    let secret = state.get_signing_secret(&client_id).await?;
    let secret = secret.ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Invalid Client ID")))?;

    let max_body_bytes = config.max_body_bytes;
    let (parts, body) = req.into_parts();
    let bytes = read_signed_body(body, max_body_bytes).await?;
    let body_str = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Request body is not valid UTF-8")))?;

    let method = parts.method.as_str();
    let path = parts.uri.path();

    let is_valid = verify_signature(
        &secret, method, path, timestamp, &nonce, body_str, &signature,
    )
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid signature")));
    }

    // Burn the nonce only once the signature is known to be genuine.
    if !state.validate_nonce(&nonce).await? {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Replay detected (nonce used)"
        )));
    }

    tracing::Span::current().record("client_id", client_id.as_str());

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn extract_auth_data(req: &Request) -> Result<(String, String, String, String), AppError> {
    let headers = req.headers();

    if headers.contains_key("X-Signature") {
        let client_id = get_header(headers, "X-Client-ID")?;
        let timestamp = get_header(headers, "X-Timestamp")?;
        let nonce = get_header(headers, "X-Nonce")?;
        let signature = get_header(headers, "X-Signature")?;
        return Ok((client_id, timestamp, nonce, signature));
    }

    if let Some(query) = req.uri().query() {
        let params: SignatureQuery = serde_urlencoded::from_str(query)
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid query parameters")))?;

        if let (Some(cid), Some(ts), Some(n), Some(sig)) = (
            params.client_id,
            params.timestamp,
            params.nonce,
            params.signature,
        ) {
            return Ok((cid, ts, n, sig));
        }
    }

    Err(AppError::AuthError(anyhow::anyhow!(
        "Missing signature data (headers or query params)"
    )))
}

/// Buffer at most `limit` bytes of a request body.
async fn read_signed_body(body: Body, limit: usize) -> Result<axum::body::Bytes, AppError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let source = e.into_inner();
        if source.is::<LengthLimitError>() {
            AppError::PayloadTooLarge(anyhow::anyhow!(
                "Request body exceeds {} bytes",
                limit
            ))
        } else {
            AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", source))
        }
    })
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}
