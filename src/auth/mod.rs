/*!
 * # Authentication Module
 *
 * Token issuance and validation for the service. Every core operation is
 * scoped by the `user_id` carried in an HS256 JWT, which clients present either
 * as `Authorization: Bearer <token>` or through the http-only `token` cookie.
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::errors::ServiceError;

pub mod email;
pub mod password;

pub use password::{hash_password, verify_password, PasswordPolicy, PasswordPolicyError};

/// Name of the cookie carrying the session token
pub const TOKEN_COOKIE: &str = "token";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller. `user_id` is the tenant key of every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: i32,
}

/// Authentication configuration
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Token lifetime in seconds
    pub token_ttl: i64,
    pub secure_cookies: bool,
}

impl AuthConfig {
    pub fn new(jwt_secret: String, token_ttl: i64, secure_cookies: bool) -> Self {
        Self {
            jwt_secret,
            token_ttl,
            secure_cookies,
        }
    }
}

/// Issued token as returned to the client
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Issues and validates session tokens
#[derive(Debug, Clone)]
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Generate a JWT for a user
    pub fn generate_token(&self, user_id: i32) -> Result<IssuedToken, ServiceError> {
        let now = Utc::now();
        let exp = now + ChronoDuration::seconds(self.config.token_ttl);

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| ServiceError::InternalError(format!("token creation failed: {}", e)))?;

        Ok(IssuedToken {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.token_ttl,
        })
    }

    /// Validate a JWT and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, ServiceError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServiceError::Unauthorized("token expired".to_string())
            }
            _ => ServiceError::Unauthorized("invalid token".to_string()),
        })
    }

    /// Resolves the caller from a raw token
    pub fn authenticate(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let claims = self.validate_token(token)?;
        let user_id = claims
            .sub
            .parse::<i32>()
            .map_err(|_| ServiceError::Unauthorized("invalid token".to_string()))?;
        Ok(AuthUser { user_id })
    }

    /// `Set-Cookie` value carrying a freshly issued token
    pub fn session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
            TOKEN_COOKIE, token, self.config.token_ttl
        );
        if self.config.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value clearing the session cookie
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0", TOKEN_COOKIE);
        if self.config.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Bearer token first, then the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = Arc::<AuthService>::from_ref(state);
        let token = token_from_headers(&parts.headers).ok_or_else(|| {
            debug!("request without credentials");
            ServiceError::Unauthorized("authentication required".to_string())
        })?;
        auth.authenticate(&token)
    }
}
