//! # Auth Gate
//!
//! Bearer validation with two acceptance modes, tried in order: the
//! configured static API key (service accounts, synthetic admin
//! identity), then an HS256-signed token whose subject names an active
//! user. User resolution is a trait seam; the persistent user store is an
//! external collaborator.

use crate::error::GatewayError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// The identity a request acts as after authentication.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub is_active: bool,
}

impl AuthUser {
    /// The synthetic identity behind the static API key.
    fn api_key_identity() -> Self {
        Self {
            id: 0,
            username: "api_key".to_string(),
            is_admin: true,
            is_active: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Resolution of token subjects to users — the boundary to the external
/// persistence collaborator.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: i64) -> Option<AuthUser>;
}

/// Directory used when no persistence collaborator is wired in: every
/// positive id resolves to an active, non-admin user.
pub struct StaticDirectory;

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup(&self, user_id: i64) -> Option<AuthUser> {
        if user_id <= 0 {
            return None;
        }
        Some(AuthUser {
            id: user_id,
            username: format!("user-{}", user_id),
            is_admin: false,
            is_active: true,
        })
    }
}

pub struct AuthGate {
    api_key: String,
    secret: String,
    algorithm: Algorithm,
    token_ttl_minutes: i64,
    directory: Arc<dyn UserDirectory>,
}

impl AuthGate {
    pub fn new(
        api_key: String,
        secret: String,
        algorithm: &str,
        token_ttl_minutes: i64,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let algorithm = match algorithm {
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            _ => Algorithm::HS256,
        };
        Self {
            api_key,
            secret,
            algorithm,
            token_ttl_minutes,
            directory,
        }
    }

    /// Validate the bearer credential and resolve the acting identity.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, GatewayError> {
        let token = bearer_token(headers)
            .ok_or_else(|| GatewayError::Unauthenticated("Not authenticated".to_string()))?;

        if !self.api_key.is_empty() && token == self.api_key {
            return Ok(AuthUser::api_key_identity());
        }

        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(self.algorithm),
        )
        .map_err(|err| {
            debug!("token validation failed: {}", err);
            GatewayError::Unauthenticated("Could not validate credentials".to_string())
        })?
        .claims;

        let user_id: i64 = claims.sub.parse().map_err(|_| {
            GatewayError::Unauthenticated("Could not validate credentials".to_string())
        })?;

        let user = self
            .directory
            .lookup(user_id)
            .await
            .ok_or_else(|| GatewayError::Unauthenticated("Could not validate credentials".to_string()))?;

        if !user.is_active {
            return Err(GatewayError::BadRequest("Inactive user".to_string()));
        }

        Ok(user)
    }

    /// Admin-only routes additionally require the admin flag.
    pub fn require_admin(&self, user: &AuthUser) -> Result<(), GatewayError> {
        if user.is_admin {
            Ok(())
        } else {
            Err(GatewayError::Forbidden("Not enough permissions".to_string()))
        }
    }

    /// Mint a signed token for a user id; used by the session surface and
    /// by tests.
    pub fn issue_token(&self, user_id: i64) -> Result<String, GatewayError> {
        let expires = Utc::now().timestamp() + self.token_ttl_minutes * 60;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: expires,
        };
        encode(
            &Header::new(self.algorithm),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| GatewayError::Internal(format!("token signing failed: {}", err)))
    }
}

/// Pull the bearer value out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    struct InactiveDirectory;

    #[async_trait]
    impl UserDirectory for InactiveDirectory {
        async fn lookup(&self, user_id: i64) -> Option<AuthUser> {
            Some(AuthUser {
                id: user_id,
                username: format!("user-{}", user_id),
                is_admin: false,
                is_active: false,
            })
        }
    }

    fn gate() -> AuthGate {
        AuthGate::new(
            "test-api-key".to_string(),
            "test-secret-key".to_string(),
            "HS256",
            30,
            Arc::new(StaticDirectory),
        )
    }

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn api_key_yields_admin_identity() {
        let user = gate()
            .authenticate(&headers_with_bearer("test-api-key"))
            .await
            .unwrap();
        assert_eq!(user.id, 0);
        assert_eq!(user.username, "api_key");
        assert!(user.is_admin);
    }

    #[tokio::test]
    async fn missing_header_is_unauthenticated() {
        let result = gate().authenticate(&HeaderMap::new()).await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn garbage_token_is_unauthenticated() {
        let result = gate()
            .authenticate(&headers_with_bearer("not-a-token"))
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn signed_token_resolves_user() {
        let gate = gate();
        let token = gate.issue_token(42).unwrap();
        let user = gate.authenticate(&headers_with_bearer(&token)).await.unwrap();
        assert_eq!(user.id, 42);
        assert!(!user.is_admin);
        assert!(user.is_active);
    }

    #[tokio::test]
    async fn token_signed_with_other_secret_is_rejected() {
        let gate = gate();
        let other = AuthGate::new(
            String::new(),
            "other-secret".to_string(),
            "HS256",
            30,
            Arc::new(StaticDirectory),
        );
        let token = other.issue_token(42).unwrap();
        let result = gate.authenticate(&headers_with_bearer(&token)).await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn inactive_user_is_a_bad_request() {
        let gate = AuthGate::new(
            String::new(),
            "test-secret-key".to_string(),
            "HS256",
            30,
            Arc::new(InactiveDirectory),
        );
        let token = gate.issue_token(7).unwrap();
        let result = gate.authenticate(&headers_with_bearer(&token)).await;
        match result {
            Err(GatewayError::BadRequest(msg)) => assert_eq!(msg, "Inactive user"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_admin_fails_admin_check() {
        let gate = gate();
        let token = gate.issue_token(5).unwrap();
        let user = gate.authenticate(&headers_with_bearer(&token)).await.unwrap();
        assert!(matches!(
            gate.require_admin(&user),
            Err(GatewayError::Forbidden(_))
        ));
        assert!(gate.require_admin(&AuthUser::api_key_identity()).is_ok());
    }
}
