//! Bearer-token authentication and the identity-provider webhook check.
//!
//! Tokens are HS256 JWTs whose audience is the identity project id. Secrets are
//! compared in constant time to mitigate timing attacks.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Request},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::errors::AppError;
use crate::models::Role;

/// Header carrying the identity-provider webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

static SHARED: OnceCell<Arc<IdentityClient>> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub uid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: Role,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated caller, inserted into request extensions by [`bearer_auth_layer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owner or admin.
    pub fn can_manage(&self, owner_id: &str) -> bool {
        self.is_admin() || self.uid == owner_id
    }

    pub fn ensure_can_manage(&self, owner_id: &str) -> Result<(), AppError> {
        if self.can_manage(owner_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Only the owner or an admin may do this".to_string(),
            ))
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))
    }
}

/// Issues and verifies bearer tokens for one identity project.
pub struct IdentityClient {
    project_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_duration: Duration,
}

impl IdentityClient {
    pub fn new(config: &Config) -> Self {
        let secret = match &config.jwt_secret {
            Some(secret) => secret.clone(),
            None => {
                tracing::warn!("JWT_SECRET not set, generating a per-process secret");
                format!(
                    "{}{}",
                    uuid::Uuid::new_v4().simple(),
                    uuid::Uuid::new_v4().simple()
                )
            }
        };
        Self {
            project_id: config.identity.project_id.clone(),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            token_duration: config.token_duration,
        }
    }

    /// Process-wide client. Built on first call; later calls ignore `config`.
    pub fn shared(config: &Config) -> Arc<IdentityClient> {
        SHARED
            .get_or_init(|| {
                tracing::info!(project_id = %config.identity.project_id, "identity client initialized");
                Arc::new(IdentityClient::new(config))
            })
            .clone()
    }

    pub fn issue(&self, uid: &str, email: &str, role: Role) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: uid.to_string(),
            uid: uid.to_string(),
            email: email.to_string(),
            role,
            aud: self.project_id.clone(),
            exp: now + self.token_duration.as_secs() as i64,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AppError::internal("Failed to issue token", e))
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.project_id.as_str()]);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!(error = %e, "rejected bearer token");
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;
        let claims = data.claims;
        let uid = if claims.uid.is_empty() {
            claims.sub
        } else {
            claims.uid
        };
        Ok(Identity {
            uid,
            email: claims.email,
            role: claims.role,
        })
    }
}

/// Require `Authorization: Bearer <JWT>` and attach the caller's [`Identity`].
pub async fn bearer_auth_layer(
    identity: Arc<IdentityClient>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return AppError::Unauthorized("Missing bearer token".to_string()).into_response();
    };
    match identity.verify(&token) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Check the webhook secret header. Open when no secret is configured.
pub fn webhook_authorized(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (None, _) => true,
        (Some(expected), Some(provided)) => constant_time_compare(provided, expected),
        (Some(_), None) => false,
    }
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    fn client() -> IdentityClient {
        let dir = tempfile::TempDir::new().unwrap();
        IdentityClient::new(&test_config(dir.path()))
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
        assert!(!constant_time_compare("short", "much-longer-key"));
        assert!(constant_time_compare("", ""));
    }

    #[test]
    fn test_webhook_secret() {
        assert!(webhook_authorized(None, None));
        assert!(webhook_authorized(Some("s3cret"), Some("s3cret")));
        assert!(!webhook_authorized(Some("s3cret"), Some("guess")));
        assert!(!webhook_authorized(Some("s3cret"), None));
    }

    #[test]
    fn test_issued_token_round_trips_claims() {
        let client = client();
        let token = client.issue("u1", "u1@example.org", Role::Admin).unwrap();
        let identity = client.verify(&token).unwrap();
        assert_eq!(identity.uid, "u1");
        assert_eq!(identity.email, "u1@example.org");
        assert!(identity.is_admin());
    }

    #[test]
    fn test_foreign_audience_is_rejected() {
        let client = client();
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.identity.project_id = "other-project".to_string();
        let other = IdentityClient::new(&config);
        let token = other.issue("u1", "", Role::User).unwrap();
        assert!(matches!(client.verify(&token), Err(AppError::Unauthorized(_))));
        assert!(client.verify("not-a-jwt").is_err());
    }

    #[test]
    fn test_owner_or_admin() {
        let user = Identity {
            uid: "u1".to_string(),
            email: String::new(),
            role: Role::User,
        };
        assert!(user.can_manage("u1"));
        assert!(matches!(
            user.ensure_can_manage("u2"),
            Err(AppError::Forbidden(_))
        ));
        let admin = Identity {
            role: Role::Admin,
            ..user
        };
        assert!(admin.can_manage("u2"));
    }
}
