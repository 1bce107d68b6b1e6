//! Token state entity model
//!
//! Sealed access/refresh token pair for a tenant. Absence of a row means the
//! tenant is not connected.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "token_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: Uuid,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Vec<u8>,

    /// Absolute access token expiry
    pub expires_at: DateTimeUtc,

    /// Last successful use through the integration facade
    pub last_sync: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
