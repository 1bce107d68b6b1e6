//! Connection health checks.
//!
//! A check obtains a token through the [`TokenManager`] and spends it on one
//! cheap authenticated provider request. The outcome is reported, never
//! raised: only storage failures surface as errors.

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::ConnectionPhase;
use crate::providers::ProviderError;
use crate::telemetry::metric;
use crate::token_manager::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    /// The provider refused the token; the tenant has been disconnected.
    AuthError,
    /// Transient failure; nothing was changed.
    NetworkError,
    NotConfigured,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::AuthError => "auth_error",
            ProbeOutcome::NetworkError => "network_error",
            ProbeOutcome::NotConfigured => "not_configured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ConnectionTestReport {
    pub reachable: bool,
    pub outcome: ProbeOutcome,
    pub message: String,
}

impl ConnectionTestReport {
    fn new<S: Into<String>>(outcome: ProbeOutcome, message: S) -> Self {
        Self {
            reachable: outcome == ProbeOutcome::Success,
            outcome,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    manager: TokenManager,
}

impl HealthChecker {
    pub fn new(manager: TokenManager) -> Self {
        Self { manager }
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn test_connection(
        &self,
        tenant_id: Uuid,
    ) -> Result<ConnectionTestReport, IntegrationError> {
        let report = self.run_probe(tenant_id).await?;

        counter!(metric::PROBE_OUTCOMES, "outcome" => report.outcome.as_str()).increment(1);
        info!(
            outcome = report.outcome.as_str(),
            reachable = report.reachable,
            "Connection test finished"
        );
        Ok(report)
    }

    async fn run_probe(&self, tenant_id: Uuid) -> Result<ConnectionTestReport, IntegrationError> {
        let token = match self.manager.get_valid_token(tenant_id).await {
            Ok(token) => token,
            Err(err) => return report_for(err),
        };
        let config = match self.manager.connection_config(tenant_id).await {
            Ok(config) => config,
            Err(err) => return report_for(err),
        };

        let provider = self.manager.provider();
        let probe = timeout(
            self.manager.lifecycle().request_timeout(),
            provider.probe(&config, &token),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));

        match probe {
            Ok(()) => Ok(ConnectionTestReport::new(
                ProbeOutcome::Success,
                "Bling accepted the stored credentials",
            )),
            Err(err) if err.is_rejection() => {
                warn!(error = %err, phase = %ConnectionPhase::Disconnected, "Probe was rejected");
                self.manager.mark_rejected(tenant_id, &token).await?;
                Ok(ConnectionTestReport::new(
                    ProbeOutcome::AuthError,
                    "Bling rejected the access token; authorize the integration again",
                ))
            }
            Err(ProviderError::Configuration { details }) => Ok(ConnectionTestReport::new(
                ProbeOutcome::NotConfigured,
                details,
            )),
            Err(err) => {
                warn!(error = %err, "Probe failed");
                Ok(ConnectionTestReport::new(
                    ProbeOutcome::NetworkError,
                    format!("Bling could not be reached: {}", err),
                ))
            }
        }
    }
}

fn report_for(err: IntegrationError) -> Result<ConnectionTestReport, IntegrationError> {
    let report = match err {
        IntegrationError::ConfigInvalid(message) => {
            ConnectionTestReport::new(ProbeOutcome::NotConfigured, message)
        }
        IntegrationError::NotFound => ConnectionTestReport::new(
            ProbeOutcome::NotConfigured,
            "Bling integration is not configured for this tenant",
        ),
        IntegrationError::TokenExpired | IntegrationError::AuthorizationError(_) => {
            ConnectionTestReport::new(
                ProbeOutcome::AuthError,
                "The integration is disconnected; authorize it again",
            )
        }
        IntegrationError::Storage(_) => return Err(err),
        other => ConnectionTestReport::new(ProbeOutcome::NetworkError, other.to_string()),
    };
    Ok(report)
}
