//! Connection config repository
//!
//! Persists each tenant's Bling client registration with the client secret
//! sealed under the service key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{DatabaseConnection, EntityTrait, Set, sea_query::OnConflict};
use uuid::Uuid;

use super::BLING_PROVIDER;
use crate::crypto::{CryptoKey, SealedField, open_str, seal_str};
use crate::error::IntegrationError;
use crate::models::connection_config::{self, Entity as ConnectionConfigs};
use crate::models::{ClientSecret, ConnectionConfig, ConnectionConfigInput};
use crate::store::{CredentialStore, resolve_client_secret};

#[derive(Debug, Clone)]
pub struct ConnectionConfigRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl ConnectionConfigRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    async fn find_model(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<connection_config::Model>, IntegrationError> {
        Ok(ConnectionConfigs::find_by_id(tenant_id)
            .one(&*self.db)
            .await?)
    }

    fn open_secret(&self, model: &connection_config::Model) -> Result<ClientSecret, IntegrationError> {
        let secret = open_str(
            &self.crypto_key,
            model.tenant_id,
            &model.provider,
            SealedField::ClientSecret,
            &model.client_secret_ciphertext,
        )
        .map_err(|e| {
            tracing::error!(tenant_id = %model.tenant_id, "Client secret could not be opened");
            IntegrationError::from(e)
        })?;
        Ok(ClientSecret::new(secret))
    }

    fn to_domain(&self, model: connection_config::Model) -> Result<ConnectionConfig, IntegrationError> {
        let client_secret = self.open_secret(&model)?;
        Ok(ConnectionConfig {
            tenant_id: model.tenant_id,
            client_id: model.client_id,
            client_secret,
            redirect_uri: model.redirect_uri,
            environment: model.environment.parse()?,
            updated_at: model.updated_at,
        })
    }
}

#[async_trait]
impl CredentialStore for ConnectionConfigRepository {
    async fn get(&self, tenant_id: Uuid) -> Result<ConnectionConfig, IntegrationError> {
        let model = self
            .find_model(tenant_id)
            .await?
            .ok_or(IntegrationError::NotFound)?;
        self.to_domain(model)
    }

    async fn save(
        &self,
        tenant_id: Uuid,
        input: ConnectionConfigInput,
    ) -> Result<ConnectionConfig, IntegrationError> {
        let input = input.normalized()?;
        let existing = self.find_model(tenant_id).await?;

        // Only open the stored secret when the form left it out.
        let existing_secret = match (&input.client_secret, &existing) {
            (None, Some(model)) => Some(self.open_secret(model)?),
            _ => None,
        };
        let client_secret = resolve_client_secret(input.client_secret, existing_secret)?;

        let sealed = seal_str(
            &self.crypto_key,
            tenant_id,
            BLING_PROVIDER,
            SealedField::ClientSecret,
            client_secret.expose(),
        )?;

        let now = Utc::now();
        let created_at = existing.as_ref().map(|m| m.created_at).unwrap_or(now);
        let active = connection_config::ActiveModel {
            tenant_id: Set(tenant_id),
            provider: Set(BLING_PROVIDER.to_string()),
            client_id: Set(input.client_id.clone()),
            client_secret_ciphertext: Set(sealed),
            redirect_uri: Set(input.redirect_uri.clone()),
            environment: Set(input.environment.as_str().to_string()),
            created_at: Set(created_at),
            updated_at: Set(now),
        };

        ConnectionConfigs::insert(active)
            .on_conflict(
                OnConflict::column(connection_config::Column::TenantId)
                    .update_columns([
                        connection_config::Column::ClientId,
                        connection_config::Column::ClientSecretCiphertext,
                        connection_config::Column::RedirectUri,
                        connection_config::Column::Environment,
                        connection_config::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            environment = %input.environment,
            created = existing.is_none(),
            "Saved Bling connection config"
        );

        Ok(ConnectionConfig {
            tenant_id,
            client_id: input.client_id,
            client_secret,
            redirect_uri: input.redirect_uri,
            environment: input.environment,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Environment;
    use crate::repositories::test_support::{key, setup_db};

    fn input(secret: Option<&str>) -> ConnectionConfigInput {
        ConnectionConfigInput {
            client_id: "client-1".to_string(),
            client_secret: secret.map(str::to_string),
            redirect_uri: "https://vng.example.com/integrations/bling/callback".to_string(),
            environment: Environment::Production,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let repo = ConnectionConfigRepository::new(setup_db().await, key());
        let tenant = Uuid::new_v4();

        assert_eq!(repo.get(tenant).await, Err(IntegrationError::NotFound));

        repo.save(tenant, input(Some("s3cret"))).await.unwrap();
        let loaded = repo.get(tenant).await.unwrap();

        assert_eq!(loaded.client_id, "client-1");
        assert_eq!(loaded.client_secret.expose(), "s3cret");
        assert_eq!(loaded.environment, Environment::Production);
    }

    #[tokio::test]
    async fn test_secret_is_sealed_at_rest() {
        let db = setup_db().await;
        let repo = ConnectionConfigRepository::new(db.clone(), key());
        let tenant = Uuid::new_v4();
        repo.save(tenant, input(Some("s3cret"))).await.unwrap();

        let row = ConnectionConfigs::find_by_id(tenant)
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert!(
            !row.client_secret_ciphertext
                .windows(6)
                .any(|window| window == b"s3cret")
        );

        let other_key = ConnectionConfigRepository::new(db, CryptoKey::new(vec![8u8; 32]).unwrap());
        assert!(matches!(
            other_key.get(tenant).await,
            Err(IntegrationError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_without_secret_keeps_existing() {
        let repo = ConnectionConfigRepository::new(setup_db().await, key());
        let tenant = Uuid::new_v4();

        assert!(matches!(
            repo.save(tenant, input(None)).await,
            Err(IntegrationError::ConfigInvalid(_))
        ));

        repo.save(tenant, input(Some("first"))).await.unwrap();
        let edited = repo
            .save(
                tenant,
                ConnectionConfigInput {
                    environment: Environment::Sandbox,
                    ..input(None)
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.client_secret.expose(), "first");

        let loaded = repo.get(tenant).await.unwrap();
        assert_eq!(loaded.environment, Environment::Sandbox);
        assert_eq!(loaded.client_secret.expose(), "first");
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_persisted() {
        let repo = ConnectionConfigRepository::new(setup_db().await, key());
        let tenant = Uuid::new_v4();

        let result = repo
            .save(
                tenant,
                ConnectionConfigInput {
                    redirect_uri: "".to_string(),
                    ..input(Some("secret"))
                },
            )
            .await;
        assert!(matches!(result, Err(IntegrationError::ConfigInvalid(_))));
        assert_eq!(repo.get(tenant).await, Err(IntegrationError::NotFound));
    }
}
