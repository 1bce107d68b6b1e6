//! Token state repository
//!
//! Stores one sealed token pair per tenant. Conditional writes run inside a
//! transaction that locks the row, opens the stored refresh token and compares
//! it before touching anything.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect,
    Set, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use uuid::Uuid;

use super::BLING_PROVIDER;
use crate::crypto::{CryptoKey, SealedField, open_str, seal_str};
use crate::error::IntegrationError;
use crate::models::token_state::{self, Entity as TokenStates};
use crate::models::{AccessToken, RefreshToken, TokenState};
use crate::store::TokenStore;

#[derive(Debug, Clone)]
pub struct TokenStateRepository {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

struct SealedPair {
    access: Vec<u8>,
    refresh: Vec<u8>,
}

impl TokenStateRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    fn seal(&self, state: &TokenState) -> Result<SealedPair, IntegrationError> {
        Ok(SealedPair {
            access: seal_str(
                &self.crypto_key,
                state.tenant_id,
                BLING_PROVIDER,
                SealedField::AccessToken,
                state.access_token.expose(),
            )?,
            refresh: seal_str(
                &self.crypto_key,
                state.tenant_id,
                BLING_PROVIDER,
                SealedField::RefreshToken,
                state.refresh_token.expose(),
            )?,
        })
    }

    fn open_refresh(&self, model: &token_state::Model) -> Result<RefreshToken, IntegrationError> {
        Ok(RefreshToken::new(open_str(
            &self.crypto_key,
            model.tenant_id,
            BLING_PROVIDER,
            SealedField::RefreshToken,
            &model.refresh_token_ciphertext,
        )?))
    }

    fn to_domain(&self, model: token_state::Model) -> Result<TokenState, IntegrationError> {
        let access = open_str(
            &self.crypto_key,
            model.tenant_id,
            BLING_PROVIDER,
            SealedField::AccessToken,
            &model.access_token_ciphertext,
        )
        .inspect_err(|_| {
            tracing::error!(tenant_id = %model.tenant_id, "Access token could not be opened");
        })?;
        let refresh_token = self.open_refresh(&model)?;

        Ok(TokenState {
            tenant_id: model.tenant_id,
            access_token: AccessToken::new(access),
            refresh_token,
            expires_at: model.expires_at,
            last_sync: model.last_sync,
        })
    }

    /// Locks the tenant's row and reports whether its refresh token is `expected`.
    async fn current_matches(
        &self,
        txn: &DatabaseTransaction,
        tenant_id: Uuid,
        expected: &RefreshToken,
    ) -> Result<bool, IntegrationError> {
        let row = TokenStates::find_by_id(tenant_id)
            .lock_exclusive()
            .one(txn)
            .await?;

        match row {
            Some(model) => Ok(&self.open_refresh(&model)? == expected),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TokenStore for TokenStateRepository {
    async fn get(&self, tenant_id: Uuid) -> Result<Option<TokenState>, IntegrationError> {
        TokenStates::find_by_id(tenant_id)
            .one(&*self.db)
            .await?
            .map(|model| self.to_domain(model))
            .transpose()
    }

    async fn put(&self, state: TokenState) -> Result<(), IntegrationError> {
        let sealed = self.seal(&state)?;
        let now = Utc::now();

        let active = token_state::ActiveModel {
            tenant_id: Set(state.tenant_id),
            access_token_ciphertext: Set(sealed.access),
            refresh_token_ciphertext: Set(sealed.refresh),
            expires_at: Set(state.expires_at),
            last_sync: Set(state.last_sync),
            created_at: Set(now),
            updated_at: Set(now),
        };

        TokenStates::insert(active)
            .on_conflict(
                OnConflict::column(token_state::Column::TenantId)
                    .update_columns([
                        token_state::Column::AccessTokenCiphertext,
                        token_state::Column::RefreshTokenCiphertext,
                        token_state::Column::ExpiresAt,
                        token_state::Column::LastSync,
                        token_state::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        Ok(())
    }

    async fn replace_if_current(
        &self,
        expected: &RefreshToken,
        state: TokenState,
    ) -> Result<bool, IntegrationError> {
        let sealed = self.seal(&state)?;
        let txn = self.db.begin().await?;

        if !self.current_matches(&txn, state.tenant_id, expected).await? {
            txn.rollback().await?;
            return Ok(false);
        }

        TokenStates::update_many()
            .col_expr(
                token_state::Column::AccessTokenCiphertext,
                Expr::value(sealed.access),
            )
            .col_expr(
                token_state::Column::RefreshTokenCiphertext,
                Expr::value(sealed.refresh),
            )
            .col_expr(token_state::Column::ExpiresAt, Expr::value(state.expires_at))
            .col_expr(token_state::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(token_state::Column::TenantId.eq(state.tenant_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(true)
    }

    async fn clear_if_current(
        &self,
        tenant_id: Uuid,
        expected: &RefreshToken,
    ) -> Result<bool, IntegrationError> {
        let txn = self.db.begin().await?;

        if !self.current_matches(&txn, tenant_id, expected).await? {
            txn.rollback().await?;
            return Ok(false);
        }

        TokenStates::delete_by_id(tenant_id).exec(&txn).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn clear(&self, tenant_id: Uuid) -> Result<bool, IntegrationError> {
        let result = TokenStates::delete_by_id(tenant_id).exec(&*self.db).await?;
        Ok(result.rows_affected > 0)
    }

    async fn touch_last_sync(
        &self,
        tenant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), IntegrationError> {
        TokenStates::update_many()
            .col_expr(token_state::Column::LastSync, Expr::value(Some(at)))
            .filter(token_state::Column::TenantId.eq(tenant_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>, IntegrationError> {
        Ok(TokenStates::find()
            .select_only()
            .column(token_state::Column::TenantId)
            .filter(token_state::Column::ExpiresAt.lt(before))
            .into_tuple::<Uuid>()
            .all(&*self.db)
            .await?)
    }
}
