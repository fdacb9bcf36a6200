use sea_orm_migration::prelude::*;

use super::m20250101_000001_create_plugin_registry::Plugins;

/// Migration 2: curated collections and the download-event log.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PluginCollections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PluginCollections::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PluginCollections::Name)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PluginCollections::Description).text().not_null())
                    .col(
                        ColumnDef::new(PluginCollections::CuratorId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PluginCollections::PluginIds).text().not_null())
                    .col(
                        ColumnDef::new(PluginCollections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PluginCollections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PluginDownloads::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PluginDownloads::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PluginDownloads::PluginId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PluginDownloads::UserId).string_len(255))
                    .col(ColumnDef::new(PluginDownloads::Version).string_len(64).not_null())
                    .col(
                        ColumnDef::new(PluginDownloads::DownloadedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_plugin_downloads_plugin_id")
                            .from(PluginDownloads::Table, PluginDownloads::PluginId)
                            .to(Plugins::Table, Plugins::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_plugin_downloads_plugin_id")
                    .table(PluginDownloads::Table)
                    .col(PluginDownloads::PluginId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PluginDownloads::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PluginCollections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PluginCollections {
    Table,
    Id,
    Name,
    Description,
    CuratorId,
    PluginIds,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PluginDownloads {
    Table,
    Id,
    PluginId,
    UserId,
    Version,
    DownloadedAt,
}
