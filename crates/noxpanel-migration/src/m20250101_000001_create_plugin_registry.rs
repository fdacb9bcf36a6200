use sea_orm_migration::prelude::*;

/// Migration 1: plugin catalog.
///
/// - `plugins`: one row per plugin id, JSON documents stored as TEXT
/// - `plugin_ratings`: one rating per (plugin, user)
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ── plugins table ─────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Plugins::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Plugins::Id)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Plugins::Name).string_len(255).not_null())
                    .col(ColumnDef::new(Plugins::Version).string_len(64).not_null())
                    .col(ColumnDef::new(Plugins::Description).text())
                    .col(ColumnDef::new(Plugins::PluginType).string_len(32).not_null())
                    .col(ColumnDef::new(Plugins::Status).string_len(20).not_null())
                    .col(ColumnDef::new(Plugins::PublisherId).string_len(255).not_null())
                    .col(ColumnDef::new(Plugins::Category).string_len(100).not_null())
                    .col(ColumnDef::new(Plugins::Tags).text().not_null())
                    .col(ColumnDef::new(Plugins::Price).double().not_null())
                    .col(ColumnDef::new(Plugins::LicenseType).string_len(50).not_null())
                    .col(ColumnDef::new(Plugins::Metadata).text().not_null())
                    .col(ColumnDef::new(Plugins::Statistics).text().not_null())
                    .col(ColumnDef::new(Plugins::SecurityScan).text())
                    .col(ColumnDef::new(Plugins::ComplianceChecks).text().not_null())
                    .col(ColumnDef::new(Plugins::Versions).text().not_null())
                    .col(
                        ColumnDef::new(Plugins::LatestVersion)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Plugins::DownloadUrl).string_len(500))
                    .col(ColumnDef::new(Plugins::PackageHash).string_len(128))
                    .col(ColumnDef::new(Plugins::PackageSize).big_integer().not_null())
                    .col(
                        ColumnDef::new(Plugins::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Plugins::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Plugins::PublishedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        // ── plugin_ratings table ──────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(PluginRatings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PluginRatings::PluginId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PluginRatings::UserId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PluginRatings::Rating).integer().not_null())
                    .col(ColumnDef::new(PluginRatings::Review).text().not_null())
                    .col(
                        ColumnDef::new(PluginRatings::HelpfulVotes)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PluginRatings::VerifiedPurchase)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PluginRatings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PluginRatings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(PluginRatings::PluginId)
                            .col(PluginRatings::UserId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_plugin_ratings_plugin_id")
                            .from(PluginRatings::Table, PluginRatings::PluginId)
                            .to(Plugins::Table, Plugins::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ── indexes ───────────────────────────────────────────────────
        for (name, column) in [
            ("idx_plugins_status", Plugins::Status),
            ("idx_plugins_category", Plugins::Category),
            ("idx_plugins_publisher_id", Plugins::PublisherId),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Plugins::Table)
                        .col(column)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;
        }

        manager
            .create_index(
                Index::create()
                    .name("idx_plugin_ratings_plugin_id")
                    .table(PluginRatings::Table)
                    .col(PluginRatings::PluginId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PluginRatings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Plugins::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Plugins {
    Table,
    Id,
    Name,
    Version,
    Description,
    PluginType,
    Status,
    PublisherId,
    Category,
    Tags,
    Price,
    LicenseType,
    Metadata,
    Statistics,
    SecurityScan,
    ComplianceChecks,
    Versions,
    LatestVersion,
    DownloadUrl,
    PackageHash,
    PackageSize,
    CreatedAt,
    UpdatedAt,
    PublishedAt,
}

#[derive(DeriveIden)]
pub enum PluginRatings {
    Table,
    PluginId,
    UserId,
    Rating,
    Review,
    HelpfulVotes,
    VerifiedPurchase,
    CreatedAt,
    UpdatedAt,
}
