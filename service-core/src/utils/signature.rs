use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature
///
/// Format: HMAC-SHA256(method|path|timestamp|nonce|body_hash, secret)
pub fn generate_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
    let payload = format!("{}|{}|{}|{}|{}", method, path, timestamp, nonce, body_hash);

    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify HMAC-SHA256 signature using constant-time comparison
pub fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, method, path, timestamp, nonce, body)?;

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

/// Header values a caller attaches to a signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub client_id: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            ("X-Client-ID", self.client_id.clone()),
            ("X-Timestamp", self.timestamp.to_string()),
            ("X-Nonce", self.nonce.clone()),
            ("X-Signature", self.signature.clone()),
        ]
    }
}

/// Sign a request for the current time with a fresh nonce.
pub fn sign_request(
    client_id: &str,
    secret: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<SignedHeaders, anyhow::Error> {
    let timestamp = chrono::Utc::now().timestamp();
    let nonce = Uuid::new_v4().to_string();
    let signature = generate_signature(secret, method, path, timestamp, &nonce, body)?;

    Ok(SignedHeaders {
        client_id: client_id.to_string(),
        timestamp,
        nonce,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "my_secret_key";
    const PATH: &str = "/internal/transactions/ingest";
    const BODY: &str = r#"{"tenantId":"t","accountId":"a","transactions":[]}"#;

    #[test]
    fn test_signature_generation_and_verification() {
        let signature = generate_signature(SECRET, "POST", PATH, 1678886400, "nonce-1", BODY).unwrap();
        assert_eq!(signature.len(), 64);

        let is_valid =
            verify_signature(SECRET, "POST", PATH, 1678886400, "nonce-1", BODY, &signature).unwrap();
        assert!(is_valid);
    }

    #[test]
    fn test_tampered_body() {
        let signature = generate_signature(SECRET, "POST", PATH, 1678886400, "nonce-1", BODY).unwrap();
        let tampered = BODY.replace("\"a\"", "\"b\"");

        let is_valid =
            verify_signature(SECRET, "POST", PATH, 1678886400, "nonce-1", &tampered, &signature)
                .unwrap();
        assert!(!is_valid);
    }

    #[test]
    fn test_sign_request_round_trips() {
        let headers = sign_request("sync-worker", SECRET, "POST", PATH, BODY).unwrap();
        assert!(
            verify_signature(
                SECRET,
                "POST",
                PATH,
                headers.timestamp,
                &headers.nonce,
                BODY,
                &headers.signature
            )
            .unwrap()
        );
        assert_eq!(headers.pairs()[0].1, "sync-worker");
    }
}
