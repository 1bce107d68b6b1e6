//! Database migrations for the VNG connection service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_090000_create_connection_configs;
mod m2025_11_10_090100_create_token_states;
mod m2025_11_10_090200_create_authorization_states;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_090000_create_connection_configs::Migration),
            Box::new(m2025_11_10_090100_create_token_states::Migration),
            Box::new(m2025_11_10_090200_create_authorization_states::Migration),
        ]
    }
}
