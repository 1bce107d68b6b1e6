//! # Authorization State Model
//!
//! CSRF `state` values issued when a tenant starts the authorization-code flow.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "authorization_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant that started the flow
    pub tenant_id: Uuid,

    /// Opaque value echoed back by the provider on the callback
    #[sea_orm(unique)]
    pub state: String,

    pub expires_at: DateTimeUtc,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for super::integration::PendingAuthorization {
    fn from(model: Model) -> Self {
        Self {
            tenant_id: model.tenant_id,
            state: model.state,
            expires_at: model.expires_at,
        }
    }
}
