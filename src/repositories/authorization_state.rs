//! # Authorization State Repository
//!
//! Database operations for pending authorize redirects.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::PendingAuthorization;
use crate::models::authorization_state::{self, ActiveModel, Entity};
use crate::store::AuthorizationStore;

pub struct AuthorizationStateRepository {
    db: Arc<DatabaseConnection>,
}

impl AuthorizationStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthorizationStore for AuthorizationStateRepository {
    async fn create(&self, pending: PendingAuthorization) -> Result<(), IntegrationError> {
        let active = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(pending.tenant_id),
            state: Set(pending.state),
            expires_at: Set(pending.expires_at),
            created_at: Set(Utc::now()),
        };

        Entity::insert(active)
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn find_live(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingAuthorization>, IntegrationError> {
        let found = Entity::find()
            .filter(authorization_state::Column::State.eq(state))
            .filter(authorization_state::Column::ExpiresAt.gt(now))
            .one(&*self.db)
            .await?;

        Ok(found.map(PendingAuthorization::from))
    }

    async fn has_live(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, IntegrationError> {
        let count = Entity::find()
            .filter(authorization_state::Column::TenantId.eq(tenant_id))
            .filter(authorization_state::Column::ExpiresAt.gt(now))
            .count(&*self.db)
            .await?;

        Ok(count > 0)
    }

    async fn clear_tenant(&self, tenant_id: Uuid) -> Result<u64, IntegrationError> {
        let result = Entity::delete_many()
            .filter(authorization_state::Column::TenantId.eq(tenant_id))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, IntegrationError> {
        let result = Entity::delete_many()
            .filter(authorization_state::Column::ExpiresAt.lte(now))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }
}
