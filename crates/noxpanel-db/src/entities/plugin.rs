use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One catalog row per plugin id. The `metadata`, `statistics`,
/// `security_scan`, `compliance_checks`, `versions` and `tags` columns hold
/// JSON documents; their shape is owned by the registry layer.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "plugins")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub version: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub plugin_type: String,
    pub status: String,
    pub publisher_id: String,
    pub category: String,
    #[sea_orm(column_type = "Text")]
    pub tags: String,
    #[sea_orm(column_type = "Double")]
    pub price: f64,
    pub license_type: String,
    #[sea_orm(column_type = "Text")]
    pub metadata: String,
    #[sea_orm(column_type = "Text")]
    pub statistics: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub security_scan: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub compliance_checks: String,
    #[sea_orm(column_type = "Text")]
    pub versions: String,
    pub latest_version: String,
    pub download_url: Option<String>,
    pub package_hash: Option<String>,
    pub package_size: i64,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub published_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::plugin_rating::Entity")]
    PluginRatings,
    #[sea_orm(has_many = "super::plugin_download::Entity")]
    PluginDownloads,
}

impl Related<super::plugin_rating::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PluginRatings.def()
    }
}

impl Related<super::plugin_download::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PluginDownloads.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
