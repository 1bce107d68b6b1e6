//! # Data Models
//!
//! SeaORM entities for persisted integration state plus the domain types the
//! connection lifecycle components exchange.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod authorization_state;
pub mod connection_config;
pub mod integration;
pub mod token_state;

pub use authorization_state::Entity as AuthorizationStateEntity;
pub use connection_config::Entity as ConnectionConfigEntity;
pub use integration::{
    AccessToken, ClientSecret, ConnectionConfig, ConnectionConfigInput, ConnectionPhase,
    ConnectionStatus, Environment, PendingAuthorization, REDACTED_SECRET, RefreshToken,
    TokenState,
};
pub use token_state::Entity as TokenStateEntity;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "vng-connect".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
