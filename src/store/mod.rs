//! Tenant-keyed storage seams for connection configs, tokens and pending
//! authorizations.
//!
//! Components receive these as `Arc<dyn …>` so the SeaORM repositories and the
//! in-memory [`MemoryStore`] are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::{
    ClientSecret, ConnectionConfig, ConnectionConfigInput, PendingAuthorization, RefreshToken,
    TokenState,
};

pub mod memory;

pub use memory::MemoryStore;

/// Per-tenant OAuth client registration.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns [`IntegrationError::NotFound`] when the tenant never configured Bling.
    async fn get(&self, tenant_id: Uuid) -> Result<ConnectionConfig, IntegrationError>;

    /// Validates and persists `input`, creating or replacing the tenant's config.
    async fn save(
        &self,
        tenant_id: Uuid,
        input: ConnectionConfigInput,
    ) -> Result<ConnectionConfig, IntegrationError>;
}

/// Token pairs. Only the token manager writes through this trait.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, tenant_id: Uuid) -> Result<Option<TokenState>, IntegrationError>;

    /// Unconditionally stores `state`, replacing whatever the tenant had.
    async fn put(&self, state: TokenState) -> Result<(), IntegrationError>;

    /// Stores `state` only while the tenant's current refresh token equals
    /// `expected`. Returns whether the swap happened.
    async fn replace_if_current(
        &self,
        expected: &RefreshToken,
        state: TokenState,
    ) -> Result<bool, IntegrationError>;

    /// Removes the tenant's tokens only while the current refresh token equals
    /// `expected`. Returns whether anything was removed.
    async fn clear_if_current(
        &self,
        tenant_id: Uuid,
        expected: &RefreshToken,
    ) -> Result<bool, IntegrationError>;

    /// Removes the tenant's tokens. Returns whether anything was removed.
    async fn clear(&self, tenant_id: Uuid) -> Result<bool, IntegrationError>;

    async fn touch_last_sync(
        &self,
        tenant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), IntegrationError>;

    /// Tenants whose access token expires before `before`.
    async fn expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>, IntegrationError>;
}

/// CSRF `state` values of authorize redirects in progress.
#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn create(&self, pending: PendingAuthorization) -> Result<(), IntegrationError>;

    /// Looks up a `state` that has not expired at `now`.
    async fn find_live(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingAuthorization>, IntegrationError>;

    async fn has_live(&self, tenant_id: Uuid, now: DateTime<Utc>)
    -> Result<bool, IntegrationError>;

    async fn clear_tenant(&self, tenant_id: Uuid) -> Result<u64, IntegrationError>;

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, IntegrationError>;
}

/// The three stores a [`crate::token_manager::TokenManager`] is wired with.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub authorizations: Arc<dyn AuthorizationStore>,
}

impl Stores {
    /// Backs every seam with the same in-process store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            credentials: store.clone(),
            tokens: store.clone(),
            authorizations: store,
        }
    }
}

/// Picks the secret to persist: a new one from the form or the stored one.
pub(crate) fn resolve_client_secret(
    submitted: Option<String>,
    existing: Option<ClientSecret>,
) -> Result<ClientSecret, IntegrationError> {
    match (submitted, existing) {
        (Some(secret), _) => Ok(ClientSecret::new(secret)),
        (None, Some(existing)) => Ok(existing),
        (None, None) => Err(IntegrationError::ConfigInvalid(
            "client_secret is required when configuring the integration".to_string(),
        )),
    }
}
