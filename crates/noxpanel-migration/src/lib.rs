pub use sea_orm_migration::prelude::*;

mod m20250101_000001_create_plugin_registry;
mod m20250101_000002_create_plugin_activity;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_plugin_registry::Migration),
            Box::new(m20250101_000002_create_plugin_activity::Migration),
        ]
    }
}
