//! # Integration Facade
//!
//! The only way features reach Bling. Callers hand over a closure that receives
//! an [`AuthorizedSession`]; token lookup, the forced refresh after a rejected
//! call and the single retry happen here.

use std::future::Future;

use metrics::counter;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::AccessToken;
use crate::providers::ProviderError;
use crate::telemetry::metric;
use crate::token_manager::TokenManager;

/// What a facade callback gets to work with.
#[derive(Debug, Clone)]
pub struct AuthorizedSession {
    pub access_token: AccessToken,
    /// REST base for the tenant's environment, without a trailing slash.
    pub api_base: String,
}

/// Failure reported by a facade callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The provider refused the access token; triggers one refresh and retry.
    Unauthorized(String),
    Failed(IntegrationError),
}

impl From<ProviderError> for CallError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected { .. } => CallError::Unauthorized(err.to_string()),
            ProviderError::Http { status, body } => {
                CallError::Failed(IntegrationError::Upstream { status, body })
            }
            ProviderError::Configuration { details } => {
                CallError::Failed(IntegrationError::ConfigInvalid(details))
            }
            ref other => CallError::Failed(IntegrationError::NetworkError {
                details: other.to_string(),
                retry_after: other.retry_after(),
            }),
        }
    }
}

impl From<IntegrationError> for CallError {
    fn from(err: IntegrationError) -> Self {
        CallError::Failed(err)
    }
}

#[derive(Clone)]
pub struct IntegrationFacade {
    manager: TokenManager,
}

impl IntegrationFacade {
    pub fn new(manager: TokenManager) -> Self {
        Self { manager }
    }

    /// Runs `call` with a valid token.
    ///
    /// A rejection triggers exactly one forced refresh and one retry. A second
    /// rejection, or a failed forced refresh, yields
    /// [`IntegrationError::IntegrationUnavailable`]. Successful calls update
    /// the tenant's `last_sync`.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn with_valid_token<T, F, Fut>(
        &self,
        tenant_id: Uuid,
        mut call: F,
    ) -> Result<T, IntegrationError>
    where
        F: FnMut(AuthorizedSession) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let config = self.manager.connection_config(tenant_id).await?;
        let api_base = self.manager.provider().api_base(config.environment);

        let token = self.manager.get_valid_token(tenant_id).await?;
        let session = AuthorizedSession {
            access_token: token.clone(),
            api_base: api_base.clone(),
        };

        let reason = match call(session).await {
            Ok(value) => return Ok(self.succeeded(tenant_id, value).await),
            Err(CallError::Failed(err)) => return Err(err),
            Err(CallError::Unauthorized(reason)) => reason,
        };

        counter!(metric::FACADE_RETRIES, "provider" => self.manager.provider().slug())
            .increment(1);
        warn!(reason = %reason, "Provider rejected access token; forcing one refresh");

        let token = self
            .manager
            .refresh_rejected(tenant_id, &token)
            .await
            .map_err(|err| {
                IntegrationError::IntegrationUnavailable(format!("token refresh failed: {}", err))
            })?;

        match call(AuthorizedSession {
            access_token: token,
            api_base,
        })
        .await
        {
            Ok(value) => Ok(self.succeeded(tenant_id, value).await),
            Err(CallError::Unauthorized(reason)) => {
                warn!(reason = %reason, "Provider rejected the refreshed token");
                Err(IntegrationError::IntegrationUnavailable(format!(
                    "provider rejected the refreshed token: {}",
                    reason
                )))
            }
            Err(CallError::Failed(err)) => Err(err),
        }
    }

    async fn succeeded<T>(&self, tenant_id: Uuid, value: T) -> T {
        if let Err(err) = self.manager.record_use(tenant_id).await {
            warn!(error = %err, "Failed to record last sync");
        } else {
            debug!("Recorded last sync");
        }
        value
    }
}
