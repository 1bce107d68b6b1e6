//! Migration to create the connection_configs table.
//!
//! One row per tenant holding the Bling OAuth client registration. The client
//! secret is stored sealed; plaintext never reaches the database.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConnectionConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConnectionConfigs::TenantId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConnectionConfigs::Provider).text().not_null())
                    .col(ColumnDef::new(ConnectionConfigs::ClientId).text().not_null())
                    .col(
                        ColumnDef::new(ConnectionConfigs::ClientSecretCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ConnectionConfigs::RedirectUri).text().not_null())
                    .col(
                        ColumnDef::new(ConnectionConfigs::Environment)
                            .text()
                            .not_null()
                            .default("production"),
                    )
                    .col(
                        ColumnDef::new(ConnectionConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConnectionConfigs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConnectionConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConnectionConfigs {
    Table,
    TenantId,
    Provider,
    ClientId,
    ClientSecretCiphertext,
    RedirectUri,
    Environment,
    CreatedAt,
    UpdatedAt,
}
