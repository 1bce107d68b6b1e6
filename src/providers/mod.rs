//! OAuth provider adapters.
//!
//! [`OAuthProvider`] is the seam between the token lifecycle and the wire:
//! the manager and health checker only speak through it, tests substitute fakes.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::models::{AccessToken, ConnectionConfig, Environment, RefreshToken};

pub mod bling;

pub use bling::BlingProvider;

/// Tokens returned by a code exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    /// Absent when the provider keeps the previous refresh token valid.
    pub refresh_token: Option<RefreshToken>,
    /// Lifetime in seconds, when the provider reports one.
    pub expires_in: Option<u64>,
}

/// Classified failure of a provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused the grant or credential (OAuth `invalid_grant`, 401, ...).
    #[error("provider rejected the request with status {status}: {details}")]
    Rejected {
        status: u16,
        error_code: Option<String>,
        details: String,
    },
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<u64> },
    #[error("network error: {details}")]
    Network { details: String },
    #[error("provider request timed out")]
    Timeout,
    #[error("malformed provider response: {details}")]
    MalformedResponse { details: String },
    /// Non-success status that is neither an auth rejection nor transient.
    #[error("provider returned status {status}")]
    Http { status: u16, body: Option<String> },
    #[error("provider configuration error: {details}")]
    Configuration { details: String },
}

impl ProviderError {
    /// Whether the failure says the presented credential is no longer accepted.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }

    /// Whether retrying later without user action could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Network { .. }
                | ProviderError::Timeout
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout
        } else if error.is_decode() {
            ProviderError::MalformedResponse {
                details: error.to_string(),
            }
        } else {
            ProviderError::Network {
                details: error.to_string(),
            }
        }
    }
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Stable identifier used in logs and stored rows.
    fn slug(&self) -> &'static str;

    /// Authorization-server URL the tenant's browser is sent to.
    fn authorize_url(&self, config: &ConnectionConfig, state: &str) -> Result<Url, ProviderError>;

    /// REST API base for the given environment, handed to facade callbacks.
    fn api_base(&self, environment: Environment) -> String;

    async fn exchange_code(
        &self,
        config: &ConnectionConfig,
        code: &str,
    ) -> Result<TokenGrant, ProviderError>;

    async fn refresh(
        &self,
        config: &ConnectionConfig,
        refresh_token: &RefreshToken,
    ) -> Result<TokenGrant, ProviderError>;

    /// One cheap authenticated request proving the token works.
    async fn probe(
        &self,
        config: &ConnectionConfig,
        access_token: &AccessToken,
    ) -> Result<(), ProviderError>;
}
