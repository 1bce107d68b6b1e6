//! Connection config entity model
//!
//! One row per tenant with the OAuth client registration used against Bling.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connection_configs")]
pub struct Model {
    /// Owning tenant (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: Uuid,

    /// Provider slug, always "bling" today
    pub provider: String,

    pub client_id: String,

    /// Sealed client secret, see `crate::crypto`
    pub client_secret_ciphertext: Vec<u8>,

    pub redirect_uri: String,

    /// "sandbox" or "production"
    pub environment: String,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
