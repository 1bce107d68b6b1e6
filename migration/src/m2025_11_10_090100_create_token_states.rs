//! Migration to create the token_states table.
//!
//! Holds at most one sealed access/refresh token pair per tenant. Rows are
//! deleted on disconnect; the owning connection config is left in place.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TokenStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TokenStates::TenantId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TokenStates::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenStates::RefreshTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenStates::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenStates::LastSync)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TokenStates::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TokenStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // The background refresh loop scans by expiry.
        manager
            .create_index(
                Index::create()
                    .name("idx_token_states_expires_at")
                    .table(TokenStates::Table)
                    .col(TokenStates::ExpiresAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TokenStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TokenStates {
    Table,
    TenantId,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    LastSync,
    CreatedAt,
    UpdatedAt,
}
