//! Shared fixtures for integration tests: in-memory SQLite, a test config and
//! an app whose Bling endpoints point at a wiremock server.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vng_connect::config::{AppConfig, BlingConfig};
use vng_connect::providers::BlingProvider;
use vng_connect::server::{AppState, create_app};

pub const OPERATOR_TOKEN: &str = "test-operator-token";

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// Pinned to one connection so every handle sees the same database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_config(bling_base: &str) -> AppConfig {
    let mut config = AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        bling: BlingConfig {
            oauth_base: bling_base.to_string(),
            api_base: bling_base.to_string(),
            sandbox_oauth_base: bling_base.to_string(),
            sandbox_api_base: bling_base.to_string(),
            ..BlingConfig::default()
        },
        ..AppConfig::default()
    };
    config.token.refresh_jitter_factor = 0.0;
    config
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub bling: MockServer,
}

impl TestApp {
    pub async fn spawn() -> Result<Self> {
        let bling = MockServer::start().await;
        let config = Arc::new(test_config(&bling.uri()));
        let db = setup_test_db().await?;
        let provider = Arc::new(BlingProvider::new(
            config.bling.clone(),
            config.token.request_timeout(),
        )?);
        let state = AppState::new(config, db, provider)?;

        Ok(Self {
            router: create_app(state.clone()),
            state,
            bling,
        })
    }

    /// Sends a request as the operator, scoped to `tenant`.
    pub async fn operator(
        &self,
        method: &str,
        uri: &str,
        tenant: Uuid,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {}", OPERATOR_TOKEN))
            .header("X-Tenant-Id", tenant.to_string());

        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    pub async fn public(&self, uri: &str) -> Response<Body> {
        self.router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub async fn configure(&self, tenant: Uuid) {
        let response = self
            .operator(
                "PUT",
                "/integrations/bling/config",
                tenant,
                Some(json!({
                    "client_id": "client-1",
                    "client_secret": "s3cret",
                    "redirect_uri": "https://vng.example.com/integrations/bling/callback",
                    "environment": "production"
                })),
            )
            .await;
        assert_eq!(response.status(), 200);
    }

    /// Runs authorize and callback, with Bling issuing `at-1`/`rt-1`.
    pub async fn connect(&self, tenant: Uuid) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(token_response("at-1", "rt-1", 21_600))
            .mount(&self.bling)
            .await;

        let response = self
            .operator("POST", "/integrations/bling/authorize", tenant, None)
            .await;
        assert_eq!(response.status(), 200);
        let redirect = json_body(response).await;
        let state = redirect["state"].as_str().unwrap().to_string();

        let response = self
            .public(&format!(
                "/integrations/bling/callback?code=auth-code&state={}",
                state
            ))
            .await;
        assert_eq!(response.status(), 200);
    }
}

pub fn token_response(access: &str, refresh: &str, expires_in: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
        "token_type": "Bearer",
        "scope": "read write"
    }))
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
