//! # Bling Integration Handlers
//!
//! Tenant-scoped settings endpoints plus the public OAuth callback.

use axum::{
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::auth::{OperatorAuth, TenantExtension, TenantHeader};
use crate::error::{ApiError, IntegrationError, validation_error};
use crate::health::ConnectionTestReport;
use crate::models::{ConnectionConfig, ConnectionConfigInput, ConnectionStatus};
use crate::order_sync::SyncOutcome;
use crate::server::AppState;
use crate::token_manager::AuthorizationRedirect;

/// Returns the tenant's Bling client registration with the secret redacted
#[utoipa::path(
    get,
    path = "/integrations/bling/config",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Stored connection config", body = ConnectionConfig),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Integration not configured", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn get_config(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
) -> Result<Json<ConnectionConfig>, ApiError> {
    Ok(Json(state.credentials.get(tenant_id).await?))
}

/// Creates or replaces the tenant's Bling client registration
#[utoipa::path(
    put,
    path = "/integrations/bling/config",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    request_body = ConnectionConfigInput,
    responses(
        (status = 200, description = "Saved connection config", body = ConnectionConfig),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn put_config(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
    payload: Result<Json<ConnectionConfigInput>, JsonRejection>,
) -> Result<Json<ConnectionConfig>, ApiError> {
    let Json(input) = payload?;
    Ok(Json(state.credentials.save(tenant_id, input).await?))
}

/// Starts the OAuth authorize flow and returns the URL to redirect the user to
#[utoipa::path(
    post,
    path = "/integrations/bling/authorize",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Authorize URL generated", body = AuthorizationRedirect),
        (status = 400, description = "Integration not configured", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn authorize(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
) -> Result<Json<AuthorizationRedirect>, ApiError> {
    Ok(Json(state.manager.begin_authorization(tenant_id).await?))
}

/// Query parameters Bling appends to the redirect URI
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Completes the authorize flow with the code Bling returned
#[utoipa::path(
    get,
    path = "/integrations/bling/callback",
    params(CallbackQuery),
    responses(
        (status = 200, description = "Tenant connected", body = ConnectionStatus),
        (status = 400, description = "Authorization failed", body = ApiError),
        (status = 503, description = "Bling unreachable", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<ConnectionStatus>, ApiError> {
    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        tracing::warn!(error = %error, description = %description, "Authorization denied by Bling");
        let reason = format!("{} {}", error, description).trim().to_string();
        return Err(IntegrationError::AuthorizationError(reason).into());
    }

    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return Err(validation_error(
            "Missing callback parameters",
            serde_json::json!({ "code": "required", "state": "required" }),
        ));
    };

    let status = state
        .manager
        .complete_authorization_callback(&oauth_state, &code)
        .await?;
    Ok(Json(status))
}

/// Reports the tenant's connection phase
#[utoipa::path(
    get,
    path = "/integrations/bling/status",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Connection status", body = ConnectionStatus),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn status(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
) -> Result<Json<ConnectionStatus>, ApiError> {
    Ok(Json(state.manager.status(tenant_id).await?))
}

/// Runs one authenticated probe against Bling
#[utoipa::path(
    post,
    path = "/integrations/bling/test",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Probe outcome", body = ConnectionTestReport),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn test_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
) -> Result<Json<ConnectionTestReport>, ApiError> {
    Ok(Json(state.health.test_connection(tenant_id).await?))
}

/// Drops the tenant's tokens; the config is kept
#[utoipa::path(
    delete,
    path = "/integrations/bling/connection",
    security(("bearer_auth" = [])),
    params(TenantHeader),
    responses(
        (status = 200, description = "Tenant disconnected", body = ConnectionStatus),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
) -> Result<Json<ConnectionStatus>, ApiError> {
    Ok(Json(state.manager.disconnect(tenant_id).await?))
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct SyncOrdersQuery {
    /// Only orders on or after this date (YYYY-MM-DD)
    #[param(value_type = Option<String>, example = "2026-10-01")]
    pub since: Option<NaiveDate>,
}

/// Imports sales orders from Bling
///
/// Responds 202 with a `pending` outcome when the integration is disconnected
/// or Bling is unreachable.
#[utoipa::path(
    post,
    path = "/integrations/bling/orders/sync",
    security(("bearer_auth" = [])),
    params(TenantHeader, SyncOrdersQuery),
    responses(
        (status = 200, description = "Orders imported", body = SyncOutcome),
        (status = 202, description = "Sync deferred", body = SyncOutcome),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 502, description = "Bling returned an error", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn sync_orders(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant_id): TenantExtension,
    Query(query): Query<SyncOrdersQuery>,
) -> Result<(StatusCode, Json<SyncOutcome>), ApiError> {
    let outcome = state.orders.sync_orders(tenant_id, query.since).await?;
    let code = match outcome {
        SyncOutcome::Completed { .. } => StatusCode::OK,
        SyncOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((code, Json(outcome)))
}
