//! Identity from a trusted upstream proxy header.
//!
//! The proxy (oauth2-proxy, vouch, an API gateway) is expected to authenticate the user and
//! forward their UUID. The header must be stripped from client-supplied requests upstream, or any
//! client can claim any identity.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName};
use uuid::Uuid;

use super::{AuthError, Authenticator};
use crate::types::UserId;

#[derive(Debug, Clone)]
pub struct ProxyHeaderAuthenticator {
    header_name: HeaderName,
}

impl ProxyHeaderAuthenticator {
    pub fn new(header_name: &str) -> Result<Self, AuthError> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| AuthError::Misconfigured(format!("invalid proxy header name {header_name:?}: {e}")))?;
        Ok(Self { header_name })
    }
}

#[async_trait]
impl Authenticator for ProxyHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        let Some(value) = headers.get(&self.header_name) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|e| AuthError::InvalidHeader(format!("{}: {e}", self.header_name)))?;
        Uuid::parse_str(value.trim())
            .map(Some)
            .map_err(|e| AuthError::InvalidHeader(format!("{}: {e}", self.header_name)))
    }
}
