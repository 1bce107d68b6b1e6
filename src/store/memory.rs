//! In-process store used by tests and single-node development setups.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{AuthorizationStore, CredentialStore, TokenStore, resolve_client_secret};
use crate::error::IntegrationError;
use crate::models::{
    ConnectionConfig, ConnectionConfigInput, PendingAuthorization, RefreshToken, TokenState,
};

#[derive(Default)]
struct Tables {
    configs: HashMap<Uuid, ConnectionConfig>,
    tokens: HashMap<Uuid, TokenState>,
    authorizations: Vec<PendingAuthorization>,
}

/// Implements every store trait over a single mutex-guarded set of maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, IntegrationError> {
        self.tables
            .lock()
            .map_err(|_| IntegrationError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, tenant_id: Uuid) -> Result<ConnectionConfig, IntegrationError> {
        self.lock()?
            .configs
            .get(&tenant_id)
            .cloned()
            .ok_or(IntegrationError::NotFound)
    }

    async fn save(
        &self,
        tenant_id: Uuid,
        input: ConnectionConfigInput,
    ) -> Result<ConnectionConfig, IntegrationError> {
        let input = input.normalized()?;
        let mut tables = self.lock()?;

        let existing = tables
            .configs
            .get(&tenant_id)
            .map(|config| config.client_secret.clone());
        let client_secret = resolve_client_secret(input.client_secret, existing)?;

        let config = ConnectionConfig {
            tenant_id,
            client_id: input.client_id,
            client_secret,
            redirect_uri: input.redirect_uri,
            environment: input.environment,
            updated_at: Utc::now(),
        };
        tables.configs.insert(tenant_id, config.clone());
        Ok(config)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, tenant_id: Uuid) -> Result<Option<TokenState>, IntegrationError> {
        Ok(self.lock()?.tokens.get(&tenant_id).cloned())
    }

    async fn put(&self, state: TokenState) -> Result<(), IntegrationError> {
        self.lock()?.tokens.insert(state.tenant_id, state);
        Ok(())
    }

    async fn replace_if_current(
        &self,
        expected: &RefreshToken,
        state: TokenState,
    ) -> Result<bool, IntegrationError> {
        let mut tables = self.lock()?;
        match tables.tokens.get(&state.tenant_id) {
            Some(current) if &current.refresh_token == expected => {
                tables.tokens.insert(state.tenant_id, state);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_if_current(
        &self,
        tenant_id: Uuid,
        expected: &RefreshToken,
    ) -> Result<bool, IntegrationError> {
        let mut tables = self.lock()?;
        match tables.tokens.get(&tenant_id) {
            Some(current) if &current.refresh_token == expected => {
                tables.tokens.remove(&tenant_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear(&self, tenant_id: Uuid) -> Result<bool, IntegrationError> {
        Ok(self.lock()?.tokens.remove(&tenant_id).is_some())
    }

    async fn touch_last_sync(
        &self,
        tenant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), IntegrationError> {
        if let Some(state) = self.lock()?.tokens.get_mut(&tenant_id) {
            state.last_sync = Some(at);
        }
        Ok(())
    }

    async fn expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>, IntegrationError> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .filter(|state| state.expires_at < before)
            .map(|state| state.tenant_id)
            .collect())
    }
}

#[async_trait]
impl AuthorizationStore for MemoryStore {
    async fn create(&self, pending: PendingAuthorization) -> Result<(), IntegrationError> {
        self.lock()?.authorizations.push(pending);
        Ok(())
    }

    async fn find_live(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingAuthorization>, IntegrationError> {
        Ok(self
            .lock()?
            .authorizations
            .iter()
            .find(|pending| pending.state == state && pending.is_live(now))
            .cloned())
    }

    async fn has_live(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, IntegrationError> {
        Ok(self
            .lock()?
            .authorizations
            .iter()
            .any(|pending| pending.tenant_id == tenant_id && pending.is_live(now)))
    }

    async fn clear_tenant(&self, tenant_id: Uuid) -> Result<u64, IntegrationError> {
        let mut tables = self.lock()?;
        let before = tables.authorizations.len();
        tables
            .authorizations
            .retain(|pending| pending.tenant_id != tenant_id);
        Ok((before - tables.authorizations.len()) as u64)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, IntegrationError> {
        let mut tables = self.lock()?;
        let before = tables.authorizations.len();
        tables.authorizations.retain(|pending| pending.is_live(now));
        Ok((before - tables.authorizations.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessToken, Environment};
    use chrono::Duration;

    fn input(secret: Option<&str>) -> ConnectionConfigInput {
        ConnectionConfigInput {
            client_id: "client-1".to_string(),
            client_secret: secret.map(str::to_string),
            redirect_uri: "https://vng.example.com/integrations/bling/callback".to_string(),
            environment: Environment::Sandbox,
        }
    }

    fn token_state(tenant_id: Uuid, refresh: &str) -> TokenState {
        TokenState {
            tenant_id,
            access_token: AccessToken::new(format!("at-{refresh}")),
            refresh_token: RefreshToken::new(refresh),
            expires_at: Utc::now() + Duration::hours(1),
            last_sync: None,
        }
    }

    #[tokio::test]
    async fn test_credentials_get_and_save() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();

        assert_eq!(
            CredentialStore::get(&store, tenant).await,
            Err(IntegrationError::NotFound)
        );
        assert!(matches!(
            store.save(tenant, input(None)).await,
            Err(IntegrationError::ConfigInvalid(_))
        ));

        let saved = store.save(tenant, input(Some("secret"))).await.unwrap();
        assert_eq!(saved.client_secret.expose(), "secret");

        // Editing without a secret keeps the stored one.
        let edited = store
            .save(
                tenant,
                ConnectionConfigInput {
                    client_id: "client-2".to_string(),
                    ..input(None)
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.client_id, "client-2");
        assert_eq!(edited.client_secret.expose(), "secret");
    }

    #[tokio::test]
    async fn test_compare_and_swap_tokens() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        store.put(token_state(tenant, "rt-1")).await.unwrap();

        let swapped = store
            .replace_if_current(&RefreshToken::new("rt-1"), token_state(tenant, "rt-2"))
            .await
            .unwrap();
        assert!(swapped);

        let stale = store
            .replace_if_current(&RefreshToken::new("rt-1"), token_state(tenant, "rt-3"))
            .await
            .unwrap();
        assert!(!stale);

        let current = TokenStore::get(&store, tenant).await.unwrap().unwrap();
        assert_eq!(current.refresh_token, RefreshToken::new("rt-2"));

        assert!(
            !store
                .clear_if_current(tenant, &RefreshToken::new("rt-1"))
                .await
                .unwrap()
        );
        assert!(
            store
                .clear_if_current(tenant, &RefreshToken::new("rt-2"))
                .await
                .unwrap()
        );
        assert!(TokenStore::get(&store, tenant).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authorization_lifecycle() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();

        store
            .create(PendingAuthorization {
                tenant_id: tenant,
                state: "live".to_string(),
                expires_at: now + Duration::minutes(15),
            })
            .await
            .unwrap();
        store
            .create(PendingAuthorization {
                tenant_id: tenant,
                state: "stale".to_string(),
                expires_at: now - Duration::minutes(1),
            })
            .await
            .unwrap();

        assert!(store.find_live("live", now).await.unwrap().is_some());
        assert!(store.find_live("stale", now).await.unwrap().is_none());
        assert!(store.has_live(tenant, now).await.unwrap());

        assert_eq!(store.cleanup_expired(now).await.unwrap(), 1);
        assert_eq!(store.clear_tenant(tenant).await.unwrap(), 1);
        assert!(!store.has_live(tenant, now).await.unwrap());
    }
}
