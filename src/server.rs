//! # Server Configuration
//!
//! Wires stores, the token manager and its collaborators into the axum
//! router, and runs the HTTP server alongside the background refresh loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::facade::IntegrationFacade;
use crate::handlers::{self, integrations};
use crate::health::HealthChecker;
use crate::order_sync::OrderSync;
use crate::providers::BlingProvider;
use crate::repositories::database_stores;
use crate::store::CredentialStore;
use crate::telemetry::trace_middleware;
use crate::token_manager::TokenManager;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub credentials: Arc<dyn CredentialStore>,
    pub manager: TokenManager,
    pub health: HealthChecker,
    pub orders: OrderSync,
}

impl AppState {
    /// Builds the database-backed components around `bling`.
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        bling: Arc<BlingProvider>,
    ) -> Result<Self> {
        let key_bytes = config
            .crypto_key
            .clone()
            .context("VNG_CRYPTO_KEY is required")?;
        let crypto_key = CryptoKey::new(key_bytes).context("invalid crypto key")?;

        let stores = database_stores(Arc::new(db.clone()), crypto_key);
        let credentials = stores.credentials.clone();
        let manager = TokenManager::new(config.token.clone(), stores, bling.clone());
        let health = HealthChecker::new(manager.clone());
        let orders = OrderSync::new(IntegrationFacade::new(manager.clone()), bling);

        Ok(Self {
            config,
            db,
            credentials,
            manager,
            health,
            orders,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/integrations/bling/config",
            get(integrations::get_config).put(integrations::put_config),
        )
        .route("/integrations/bling/authorize", post(integrations::authorize))
        .route("/integrations/bling/status", get(integrations::status))
        .route("/integrations/bling/test", post(integrations::test_connection))
        .route(
            "/integrations/bling/connection",
            delete(integrations::disconnect),
        )
        .route(
            "/integrations/bling/orders/sync",
            post(integrations::sync_orders),
        )
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/integrations/bling/callback", get(integrations::callback))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_middleware))
        .layer(CorsLayer::permissive())
}

/// Serves HTTP and runs background token refresh until `shutdown` fires.
pub async fn run_server(
    config: Arc<AppConfig>,
    db: DatabaseConnection,
    shutdown: CancellationToken,
) -> Result<()> {
    let bling = Arc::new(
        BlingProvider::new(config.bling.clone(), config.token.request_timeout())
            .context("failed to build Bling client")?,
    );
    let state = AppState::new(config.clone(), db, bling)?;

    let refresher = {
        let manager = state.manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    let app = create_app(state);
    let addr = config
        .bind_addr()
        .with_context(|| format!("invalid bind address {}", config.api_bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(addr = %addr, profile = %config.profile, "Server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(err) = refresher.await {
        tracing::error!(error = ?err, "Background refresh task failed");
    }
    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::integrations::get_config,
        crate::handlers::integrations::put_config,
        crate::handlers::integrations::authorize,
        crate::handlers::integrations::callback,
        crate::handlers::integrations::status,
        crate::handlers::integrations::test_connection,
        crate::handlers::integrations::disconnect,
        crate::handlers::integrations::sync_orders,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::error::ApiError,
            crate::error::ProviderErrorDetails,
            crate::models::ConnectionConfig,
            crate::models::ConnectionConfigInput,
            crate::models::ConnectionStatus,
            crate::models::ConnectionPhase,
            crate::models::Environment,
            crate::token_manager::AuthorizationRedirect,
            crate::health::ConnectionTestReport,
            crate::health::ProbeOutcome,
            crate::order_sync::SyncOutcome,
            crate::providers::bling::SalesOrder,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "VNG Connect API",
        description = "Per-tenant Bling ERP connections: settings, OAuth2 authorization, health and order sync",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
