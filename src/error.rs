//! # Error Handling
//!
//! `IntegrationError` is the taxonomy shared by the connection lifecycle
//! components. `ApiError` renders any failure as a problem+json response
//! with trace id propagation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::crypto::CryptoError;
use crate::telemetry;

/// Seconds suggested to clients after a transient provider failure.
pub const DEFAULT_NETWORK_RETRY_AFTER_SECS: u64 = 5;

const PROVIDER_SNIPPET_CHARS: usize = 200;

/// Failures surfaced by the credential store, token manager, health checker and facade.
///
/// Cloneable so a single refresh result can be fanned out to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrationError {
    /// Settings are missing or malformed; fixed through configuration, never retried.
    #[error("integration configuration is invalid: {0}")]
    ConfigInvalid(String),
    /// The provider refused a code or refresh token; the authorize flow must be redone.
    #[error("authorization failed: {0}")]
    AuthorizationError(String),
    /// The tenant is disconnected and must re-authorize.
    #[error("integration is disconnected; re-authorization required")]
    TokenExpired,
    /// Transient transport failure or timeout; state was left untouched.
    #[error("network error talking to provider: {details}")]
    NetworkError {
        details: String,
        retry_after: Option<u64>,
    },
    /// The facade gave up after one forced refresh and one retry.
    #[error("integration unavailable: {0}")]
    IntegrationUnavailable(String),
    /// No connection configuration exists for the tenant.
    #[error("no integration configured for this tenant")]
    NotFound,
    /// Non-authorization failure reported by the provider during a facade call.
    #[error("provider returned status {status}")]
    Upstream { status: u16, body: Option<String> },
    /// Persistence or crypto failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl IntegrationError {
    pub fn network<S: Into<String>>(details: S) -> Self {
        Self::NetworkError {
            details: details.into(),
            retry_after: None,
        }
    }

    /// Whether a caller may retry the same operation later without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::IntegrationUnavailable(_))
    }
}

impl From<sea_orm::DbErr> for IntegrationError {
    fn from(error: sea_orm::DbErr) -> Self {
        tracing::error!(?error, "Database error in integration store");
        Self::Storage(error.to_string())
    }
}

impl From<CryptoError> for IntegrationError {
    fn from(error: CryptoError) -> Self {
        tracing::error!(error = %error, "Crypto error in integration store");
        Self::Storage(error.to_string())
    }
}

/// JSON error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    /// Stable machine-readable code, e.g. `DISCONNECTED`
    pub code: Box<str>,
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Seconds the caller should wait before retrying
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        let trace_id = telemetry::current_trace_id()
            .unwrap_or_else(|| format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Some(trace_id.into_boxed_str()),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// What Bling answered when a call failed for a reason other than authorization.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderErrorDetails {
    /// Provider slug, always `bling` today
    pub provider: String,
    pub status: u16,
    /// First 200 characters of the response body
    pub body_snippet: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(seconds) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<IntegrationError> for ApiError {
    fn from(error: IntegrationError) -> Self {
        let (status, code, message) = match error {
            IntegrationError::ConfigInvalid(message) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
            }
            IntegrationError::AuthorizationError(reason) => (
                StatusCode::BAD_REQUEST,
                "AUTHORIZATION_FAILED",
                format!("Authorization failed: {}", reason),
            ),
            IntegrationError::TokenExpired => (
                StatusCode::CONFLICT,
                "DISCONNECTED",
                "Integration is disconnected; authorize again".to_string(),
            ),
            IntegrationError::NetworkError {
                details,
                retry_after,
            } => {
                tracing::warn!(details = %details, "Transient provider failure");
                return Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "NETWORK_ERROR",
                    "Provider could not be reached; try again shortly",
                )
                .with_retry_after(retry_after.unwrap_or(DEFAULT_NETWORK_RETRY_AFTER_SECS));
            }
            IntegrationError::IntegrationUnavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "INTEGRATION_UNAVAILABLE",
                format!("Integration unavailable: {}", reason),
            ),
            IntegrationError::NotFound => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "No Bling integration configured for this tenant".to_string(),
            ),
            IntegrationError::Upstream { status, body } => {
                return provider_error("bling", status, body);
            }
            IntegrationError::Storage(message) => {
                tracing::error!(message = %message, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        Self::new(status, code.to_string(), message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid settings payload: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("Malformed JSON: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Expected Content-Type: application/json".to_string()
            }
            other => other.body_text(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED".to_string(), message)
    }
}

/// 502 `PROVIDER_ERROR` carrying a truncated upstream body.
pub fn provider_error(provider: &str, status: u16, body: Option<String>) -> ApiError {
    let details = ProviderErrorDetails {
        provider: provider.to_string(),
        status,
        body_snippet: body.map(|body| match body.char_indices().nth(PROVIDER_SNIPPET_CHARS) {
            Some((cut, _)) => format!("{}...", &body[..cut]),
            None => body,
        }),
    };

    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR".to_string(),
        format!("Provider {} returned error status {}", provider, status),
    )
    .with_details(json!(details))
}

pub fn unauthorized(message: &str) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

/// 400 `VALIDATION_FAILED` with per-field messages in `details`.
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[test]
    fn test_integration_error_status_mapping() {
        let cases = [
            (
                IntegrationError::ConfigInvalid("redirect_uri is required".into()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
            ),
            (
                IntegrationError::AuthorizationError("invalid_grant".into()),
                StatusCode::BAD_REQUEST,
                "AUTHORIZATION_FAILED",
            ),
            (
                IntegrationError::TokenExpired,
                StatusCode::CONFLICT,
                "DISCONNECTED",
            ),
            (
                IntegrationError::network("connection reset"),
                StatusCode::SERVICE_UNAVAILABLE,
                "NETWORK_ERROR",
            ),
            (
                IntegrationError::IntegrationUnavailable("rejected after refresh".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "INTEGRATION_UNAVAILABLE",
            ),
            (
                IntegrationError::NotFound,
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
            (
                IntegrationError::Upstream {
                    status: 500,
                    body: None,
                },
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
            ),
            (
                IntegrationError::Storage("disk full".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
            ),
        ];

        for (error, status, code) in cases {
            let api_error: ApiError = error.into();
            assert_eq!(api_error.status, status);
            assert_eq!(api_error.code.as_ref(), code);
            assert!(api_error.trace_id.is_some());
        }
    }

    #[test]
    fn test_network_error_sets_retry_after_header() {
        let api_error: ApiError = IntegrationError::NetworkError {
            details: "rate limited".into(),
            retry_after: Some(30),
        }
        .into();
        let response = api_error.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "30");

        let api_error: ApiError = IntegrationError::network("timeout").into();
        assert_eq!(api_error.retry_after, Some(DEFAULT_NETWORK_RETRY_AFTER_SECS));
    }

    #[test]
    fn test_storage_error_does_not_leak_details() {
        let api_error: ApiError =
            IntegrationError::Storage("ciphertext for tenant x is corrupt".into()).into();
        assert!(!api_error.message.contains("ciphertext"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(IntegrationError::network("x").is_transient());
        assert!(IntegrationError::IntegrationUnavailable("x".into()).is_transient());
        assert!(!IntegrationError::TokenExpired.is_transient());
        assert!(!IntegrationError::ConfigInvalid("x".into()).is_transient());
    }

    #[test]
    fn test_provider_error_details() {
        let error = provider_error("bling", 429, Some("too many".to_string()));

        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.code, Box::from("PROVIDER_ERROR"));
        let details = error.details.unwrap();
        assert_eq!(details["provider"], "bling");
        assert_eq!(details["status"], 429);
    }

    #[test]
    fn test_provider_error_truncates_on_char_boundaries() {
        let body = "pedido inválido ção ".repeat(30);
        let error = provider_error("bling", 500, Some(body));

        let details = error.details.unwrap();
        let snippet = details["body_snippet"].as_str().unwrap();
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.chars().count(), 203);
    }

    #[test]
    fn test_disconnected_response_shape() {
        let response = ApiError::from(IntegrationError::TokenExpired).into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert!(response.headers().get("retry-after").is_none());
    }

    #[test]
    fn test_correlation_id_outside_requests() {
        let trace_id = ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "missing")
            .trace_id
            .unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[tokio::test]
    async fn test_trace_id_from_active_context() {
        let context = telemetry::TraceContext {
            trace_id: "req-123".to_string(),
        };
        let error = telemetry::with_trace_context(context, async {
            ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "missing")
        })
        .await;

        assert_eq!(error.trace_id.as_deref(), Some("req-123"));
    }

    #[test]
    fn test_database_errors_become_storage_failures() {
        let integration: IntegrationError = sea_orm::DbErr::Custom("boom".to_string()).into();
        assert!(matches!(integration, IntegrationError::Storage(_)));
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({ "client_id": "required" });
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(field_errors)));
        assert_eq!(unauthorized("no token").status, StatusCode::UNAUTHORIZED);
    }
}
