//! Bearer token verification and the typed caller context.
//!
//! Tokens are issued by the identity provider; this module only verifies
//! them and resolves the claims once into an [`AuthContext`] that handlers
//! receive through the [`AuthUser`] extractor.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;

/// Caller role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Member,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::SuperAdmin => "superadmin",
        }
    }

    /// Resolve the role from the loosely typed claims some issuers emit.
    ///
    /// An explicit `role` string wins; otherwise the `superadmin` and `admin`
    /// flags are honoured whether they arrive as booleans or as strings.
    fn from_claims(claims: &TokenClaims) -> Self {
        if let Some(role) = claims.role.as_deref() {
            match role.to_ascii_lowercase().as_str() {
                "superadmin" | "super_admin" => return Self::SuperAdmin,
                "admin" => return Self::Admin,
                "member" | "user" => return Self::Member,
                _ => {}
            }
        }

        if claims.superadmin.as_ref().is_some_and(flag_is_set) {
            Self::SuperAdmin
        } else if claims.admin.as_ref().is_some_and(flag_is_set) {
            Self::Admin
        } else {
            Self::Member
        }
    }
}

fn flag_is_set(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        serde_json::Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

/// Raw claims as found in the token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    #[serde(alias = "tenantId")]
    pub tenant_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub admin: Option<serde_json::Value>,
    #[serde(default)]
    pub superadmin: Option<serde_json::Value>,
    pub exp: i64,
}

/// Authenticated caller, resolved once per request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: Uuid,
    pub user_id: String,
    pub role: Role,
}

impl AuthContext {
    pub fn require_role(&self, minimum: Role) -> Result<(), AppError> {
        if self.role >= minimum {
            Ok(())
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Role '{}' is required for this operation",
                minimum.as_str()
            )))
        }
    }
}

/// Key material used to verify bearer tokens.
#[derive(Debug, Clone)]
pub enum JwtKey {
    /// Shared HS256 secret.
    Secret(String),
    /// Path to an RS256 public key in PEM form.
    RsaPublicKeyPath(String),
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(key: &JwtKey, issuer: Option<&str>, audience: Option<&str>) -> Result<Self, anyhow::Error> {
        let (decoding_key, algorithm) = match key {
            JwtKey::Secret(secret) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            JwtKey::RsaPublicKeyPath(path) => {
                let pem = fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", path, e)
                })?;
                let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;
                (key, Algorithm::RS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Verify a token and resolve the caller context.
    pub fn verify(&self, token: &str) -> Result<AuthContext, AppError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;

        let tenant_id = Uuid::parse_str(&claims.tenant_id)
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Token carries an invalid tenant_id")))?;
        if claims.sub.is_empty() {
            return Err(AppError::AuthError(anyhow::anyhow!("Token has no subject")));
        }

        Ok(AuthContext {
            tenant_id,
            role: Role::from_claims(&claims),
            user_id: claims.sub,
        })
    }
}

/// Middleware to require a valid bearer token.
pub async fn auth_middleware(
    State(verifier): State<Arc<JwtVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let context = verifier.verify(token)?;

    let span = tracing::Span::current();
    span.record("tenant_id", tracing::field::display(context.tenant_id));
    span.record("user_id", context.user_id.as_str());

    req.extensions_mut().insert(context);

    Ok(next.run(req).await)
}

/// Extractor to easily get the caller context in handlers
pub struct AuthUser(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = parts.extensions.get::<AuthContext>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Auth context missing from request extensions"
            ))
        })?;

        Ok(AuthUser(context.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(&JwtKey::Secret(SECRET.to_string()), None, None).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 300
    }

    #[test]
    fn test_member_by_default() {
        let tenant = Uuid::new_v4();
        let ctx = verifier()
            .verify(&token(json!({"sub": "u1", "tenant_id": tenant.to_string(), "exp": exp()})))
            .unwrap();
        assert_eq!(ctx.tenant_id, tenant);
        assert_eq!(ctx.user_id, "u1");
        assert_eq!(ctx.role, Role::Member);
    }

    #[test]
    fn test_string_admin_flag() {
        let ctx = verifier()
            .verify(&token(json!({
                "sub": "u1",
                "tenantId": Uuid::new_v4().to_string(),
                "admin": "true",
                "exp": exp()
            })))
            .unwrap();
        assert_eq!(ctx.role, Role::Admin);
    }

    #[test]
    fn test_role_claim_wins_over_flags() {
        let ctx = verifier()
            .verify(&token(json!({
                "sub": "u1",
                "tenant_id": Uuid::new_v4().to_string(),
                "role": "superadmin",
                "admin": false,
                "exp": exp()
            })))
            .unwrap();
        assert_eq!(ctx.role, Role::SuperAdmin);
        assert!(ctx.require_role(Role::Admin).is_ok());
    }

    #[test]
    fn test_member_cannot_act_as_admin() {
        let ctx = AuthContext {
            tenant_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            role: Role::Member,
        };
        assert!(matches!(ctx.require_role(Role::Admin), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let other = JwtVerifier::new(&JwtKey::Secret("other".to_string()), None, None).unwrap();
        let result = other.verify(&token(json!({
            "sub": "u1",
            "tenant_id": Uuid::new_v4().to_string(),
            "exp": exp()
        })));
        assert!(matches!(result, Err(AppError::InvalidToken(_))));
    }

    #[test]
    fn test_invalid_tenant_rejected() {
        let result = verifier().verify(&token(json!({
            "sub": "u1",
            "tenant_id": "not-a-uuid",
            "exp": exp()
        })));
        assert!(matches!(result, Err(AppError::AuthError(_))));
    }
}
