//! # Operator Authentication
//!
//! Settings endpoints are called by the VNG back office with a shared operator
//! bearer token and the tenant being administered in `X-Tenant-Id`. The
//! middleware validates both and leaves [`OperatorAuth`] and
//! [`TenantExtension`] in the request extensions for handlers to extract.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderName, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

pub const TENANT_HEADER: HeaderName = HeaderName::from_static("x-tenant-id");

/// Proof that the request carried a known operator token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

/// Tenant the request administers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantExtension(pub Uuid);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let tenant = authenticate(&config, request.headers())?;
    tracing::debug!(tenant_id = %tenant.0, "Operator request authenticated");

    let extensions = request.extensions_mut();
    extensions.insert(OperatorAuth);
    extensions.insert(tenant);

    Ok(next.run(request).await)
}

/// Token first, so unauthenticated callers learn nothing about tenant ids.
fn authenticate(config: &AppConfig, headers: &HeaderMap) -> Result<TenantExtension, ApiError> {
    let token = bearer_token(headers)?;
    if !is_operator_token(config, token) {
        tracing::warn!("Rejected request with unknown operator token");
        return Err(unauthorized("Invalid bearer token"));
    }

    tenant_id(headers).map(TenantExtension)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| unauthorized("Authorization header is not valid ASCII"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => {
            Ok(token.trim())
        }
        _ => Err(unauthorized("Authorization header must use the Bearer scheme")),
    }
}

fn is_operator_token(config: &AppConfig, token: &str) -> bool {
    config
        .operator_tokens
        .iter()
        .any(|known| bool::from(known.as_bytes().ct_eq(token.as_bytes())))
}

fn tenant_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let invalid = |reason: &str| {
        validation_error(
            "Invalid tenant header",
            json!({ "X-Tenant-Id": reason }),
        )
    };

    let raw = headers
        .get(TENANT_HEADER)
        .ok_or_else(|| invalid("Required header is missing"))?
        .to_str()
        .map_err(|_| invalid("Header must be valid UTF-8"))?;

    Uuid::parse_str(raw.trim()).map_err(|_| invalid("Must be a valid UUID"))
}

/// `X-Tenant-Id` as documented in OpenAPI
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct TenantHeader {
    /// Tenant whose Bling integration is being managed (UUID)
    #[serde(rename = "X-Tenant-Id")]
    #[param(rename = "X-Tenant-Id", value_type = String)]
    pub tenant_id: String,
}

impl<S> FromRequestParts<S> for TenantExtension
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Self>().copied().ok_or_else(|| {
            validation_error(
                "Tenant context missing",
                json!({ "X-Tenant-Id": "Route is not behind the operator middleware" }),
            )
        })
    }
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .copied()
            .ok_or_else(|| unauthorized("Operator authentication required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    const TOKEN: &str = "operator-token-1";

    fn config(tokens: &[&str]) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            operator_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        })
    }

    async fn echo_tenant(
        _operator: OperatorAuth,
        TenantExtension(tenant_id): TenantExtension,
    ) -> String {
        tenant_id.to_string()
    }

    async fn send(
        config: Arc<AppConfig>,
        authorization: Option<&str>,
        tenant: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().uri("/echo");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        if let Some(value) = tenant {
            builder = builder.header(TENANT_HEADER, value);
        }

        Router::new()
            .route("/echo", get(echo_tenant))
            .layer(axum::middleware::from_fn_with_state(config, auth_middleware))
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let tenant = Uuid::new_v4().to_string();
        let bearer = format!("Bearer {}", TOKEN);
        let cases = [
            (None, Some(tenant.as_str()), StatusCode::UNAUTHORIZED),
            (Some("Basic dGVzdDoxMjM="), Some(tenant.as_str()), StatusCode::UNAUTHORIZED),
            (Some("Bearer "), Some(tenant.as_str()), StatusCode::UNAUTHORIZED),
            (Some("Bearer wrong-token"), Some(tenant.as_str()), StatusCode::UNAUTHORIZED),
            // Unknown token wins over a bad tenant header.
            (Some("Bearer wrong-token"), Some("not-a-uuid"), StatusCode::UNAUTHORIZED),
            (Some(bearer.as_str()), None, StatusCode::BAD_REQUEST),
            (Some(bearer.as_str()), Some("not-a-uuid"), StatusCode::BAD_REQUEST),
        ];

        for (authorization, tenant, expected) in cases {
            let response = send(config(&[TOKEN]), authorization, tenant).await;
            assert_eq!(
                response.status(),
                expected,
                "authorization={:?} tenant={:?}",
                authorization,
                tenant
            );
        }
    }

    #[tokio::test]
    async fn test_valid_request_carries_tenant() {
        let tenant = Uuid::new_v4();
        let response = send(
            config(&[TOKEN]),
            Some(&format!("bearer {}", TOKEN)),
            Some(&format!(" {} ", tenant)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, tenant.to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_any_configured_token_is_accepted() {
        let config = config(&["token-one", "token-two"]);
        let tenant = Uuid::new_v4().to_string();

        for candidate in ["token-one", "token-two"] {
            let response = send(
                Arc::clone(&config),
                Some(&format!("Bearer {}", candidate)),
                Some(&tenant),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_extractors_outside_middleware_reject() {
        let response = Router::new()
            .route("/echo", get(echo_tenant))
            .oneshot(Request::builder().uri("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
