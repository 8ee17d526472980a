//! JWT session token creation and verification.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{AuthError, Authenticator};
use crate::types::UserId;

/// JWT session claims
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: UserId, // Subject (user ID)
    pub exp: i64,    // Expiration time
    pub iat: i64,    // Issued at
}

impl SessionClaims {
    pub fn new(user_id: UserId, expiry: Duration) -> Self {
        let now = Utc::now();
        let exp = now + expiry;
        Self {
            sub: user_id,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }
}

/// Issue an HS256 session token for `user_id`.
pub fn create_session_token(user_id: UserId, secret_key: &str, expiry: Duration) -> Result<String, AuthError> {
    let claims = SessionClaims::new(user_id, expiry);
    let key = EncodingKey::from_secret(secret_key.as_bytes());
    encode(&Header::default(), &claims, &key).map_err(|e| AuthError::Misconfigured(format!("create JWT: {e}")))
}

/// Verify a session token and return its subject.
pub fn verify_session_token(token: &str, secret_key: &str) -> Result<UserId, AuthError> {
    use jsonwebtoken::errors::ErrorKind;

    let key = DecodingKey::from_secret(secret_key.as_bytes());
    let token_data = decode::<SessionClaims>(token, &key, &Validation::default()).map_err(|e| match e.kind() {
        // Client errors - malformed tokens, invalid claims, expired tokens
        ErrorKind::InvalidToken
        | ErrorKind::InvalidSignature
        | ErrorKind::ExpiredSignature
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::ImmatureSignature
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::InvalidAlgorithm => AuthError::InvalidToken(e.to_string()),

        // Key issues and internal failures
        _ => AuthError::Misconfigured(format!("JWT verification: {e}")),
    })?;

    Ok(token_data.claims.sub)
}

/// Reads the session token from the configured cookie, falling back to a bearer header.
#[derive(Clone)]
pub struct SessionAuthenticator {
    secret_key: String,
    cookie_name: String,
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("cookie_name", &self.cookie_name)
            .finish_non_exhaustive()
    }
}

impl SessionAuthenticator {
    pub fn new(secret_key: &str, cookie_name: &str) -> Self {
        Self {
            secret_key: secret_key.to_string(),
            cookie_name: cookie_name.to_string(),
        }
    }

    fn token_from_cookie<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|cookies| cookies.split(';'))
            .filter_map(|cookie| cookie.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value)
    }
}

fn token_from_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    #[instrument(skip_all)]
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        let Some(token) = self.token_from_cookie(headers).or_else(|| token_from_bearer(headers)) else {
            return Ok(None);
        };
        verify_session_token(token, &self.secret_key).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use uuid::Uuid;

    const SECRET: &str = "test-secret-key-for-jwt";

    #[test]
    fn test_create_and_verify_session_token() {
        let user = Uuid::new_v4();
        let token = create_session_token(user, SECRET, Duration::from_secs(3600)).unwrap();
        assert!(!token.is_empty());
        assert_eq!(verify_session_token(&token, SECRET).unwrap(), user);
    }

    #[test]
    fn test_verify_token_wrong_secret() {
        let token = create_session_token(Uuid::new_v4(), SECRET, Duration::from_secs(3600)).unwrap();
        assert!(matches!(
            verify_session_token(&token, "different-secret").unwrap_err(),
            AuthError::InvalidToken(_)
        ));
    }

    #[test]
    fn test_verify_expired_token() {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: Uuid::new_v4(),
            exp: (now - chrono::Duration::seconds(3600)).timestamp(), // 1 hour ago
            iat: (now - chrono::Duration::seconds(7200)).timestamp(),
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();

        assert!(matches!(
            verify_session_token(&token, SECRET).unwrap_err(),
            AuthError::InvalidToken(_)
        ));
    }

    #[test]
    fn test_verify_malformed_token() {
        for token in ["not.a.token", "invalid", "", "too.many.parts.in.this.token"] {
            assert!(
                matches!(verify_session_token(token, SECRET), Err(AuthError::InvalidToken(_))),
                "Expected InvalidToken for token: {token}"
            );
        }
    }

    #[tokio::test]
    async fn test_cookie_is_found_among_others() {
        let user = Uuid::new_v4();
        let token = create_session_token(user, SECRET, Duration::from_secs(60)).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; imgopt_session={token}; lang=en")).unwrap(),
        );

        let auth = SessionAuthenticator::new(SECRET, "imgopt_session");
        assert_eq!(auth.authenticate(&headers).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn test_no_token_is_not_an_error() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));

        let auth = SessionAuthenticator::new(SECRET, "imgopt_session");
        assert_eq!(auth.authenticate(&headers).await.unwrap(), None);
    }
}
