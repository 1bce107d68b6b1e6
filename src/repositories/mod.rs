//! # Repository Layer
//!
//! SeaORM-backed implementations of the store traits. Secrets and tokens are
//! sealed with [`crate::crypto`] before they reach the database.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::crypto::CryptoKey;
use crate::store::Stores;

pub mod authorization_state;
pub mod connection_config;
pub mod token_state;

pub use authorization_state::AuthorizationStateRepository;
pub use connection_config::ConnectionConfigRepository;
pub use token_state::TokenStateRepository;

/// Provider slug recorded on rows and bound into sealed values.
pub const BLING_PROVIDER: &str = "bling";

/// Wires every store seam to the database.
pub fn database_stores(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Stores {
    Stores {
        credentials: Arc::new(ConnectionConfigRepository::new(db.clone(), crypto_key.clone())),
        tokens: Arc::new(TokenStateRepository::new(db.clone(), crypto_key)),
        authorizations: Arc::new(AuthorizationStateRepository::new(db)),
    }
}
