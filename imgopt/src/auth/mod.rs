//! Authentication boundary.
//!
//! The pipeline only needs to know *who* is asking, as a [`UserId`]. Each [`Authenticator`]
//! inspects the request headers and answers with:
//!
//! - `Ok(Some(user))`: credentials present and valid
//! - `Ok(None)`: no credentials of this kind
//! - `Err(_)`: credentials present but unusable (bad signature, expired, malformed id)
//!
//! # Methods
//!
//! - [`session`]: HS256 session token in a cookie or `Authorization: Bearer` header
//! - [`proxy`]: user id in a header set by a trusted upstream proxy
//!
//! [`AuthChain`] tries the enabled methods in order. [`AnonymousAuthenticator`] is used when no
//! method is enabled, which is only valid with quota accounting switched off.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;
use tracing::trace;

use crate::config::Config;
use crate::types::UserId;

pub mod proxy;
pub mod session;

pub use proxy::ProxyHeaderAuthenticator;
pub use session::SessionAuthenticator;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid session token: {0}")]
    InvalidToken(String),

    #[error("invalid identity header: {0}")]
    InvalidHeader(String),

    #[error("authentication misconfigured: {0}")]
    Misconfigured(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError>;
}

/// Never identifies anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        Ok(None)
    }
}

/// Tries each authenticator in order; the first identified user wins.
///
/// If nobody identifies the user, the first error seen is returned, so a bad session token is
/// reported even when the proxy header is simply absent.
pub struct AuthChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthChain {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }
}

#[async_trait]
impl Authenticator for AuthChain {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        let mut first_error = None;
        for authenticator in &self.authenticators {
            match authenticator.authenticate(headers).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => {}
                Err(e) => {
                    trace!(error = %e, "authenticator rejected credentials");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Build the authenticator for the enabled methods.
pub fn from_config(config: &Config) -> Result<Arc<dyn Authenticator>, AuthError> {
    let mut chain: Vec<Arc<dyn Authenticator>> = Vec::new();

    if config.auth.session.enabled {
        let secret = config
            .secret_key
            .as_deref()
            .ok_or_else(|| AuthError::Misconfigured("session auth requires secret_key".to_string()))?;
        chain.push(Arc::new(SessionAuthenticator::new(secret, &config.auth.session.cookie_name)));
    }

    if config.auth.proxy_header.enabled {
        chain.push(Arc::new(ProxyHeaderAuthenticator::new(&config.auth.proxy_header.header_name)?));
    }

    if chain.is_empty() {
        return Ok(Arc::new(AnonymousAuthenticator));
    }
    Ok(Arc::new(AuthChain::new(chain)))
}
