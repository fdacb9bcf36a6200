// Shared test utilities for integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use noxpanel_migration::MigratorTrait;
use noxpanel_plugin::{
    ExecutionContext, ManagerConfig, Marketplace, Plugin, PluginFault, PluginManager,
    PluginRegistry,
};
use serde_json::{json, Value};

pub const MANIFEST_FILE: &str = "plugin.toml";

/// In-memory SQLite with the registry schema applied.
pub async fn test_db() -> sea_orm::DatabaseConnection {
    let db = noxpanel_db::connect(&noxpanel_db::DatabaseConfig::in_memory())
        .await
        .unwrap();
    noxpanel_migration::Migrator::up(&db, None).await.unwrap();
    db
}

/// Counts calls so tests can observe what the manager invoked.
#[derive(Default)]
pub struct Calls {
    pub initialized: AtomicUsize,
    pub executed: AtomicUsize,
    pub cleaned_up: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Mock plugin: `echo` returns its params, `fail` raises a fault, anything
/// else is unknown.
pub struct Recorder {
    pub calls: Arc<Calls>,
}

#[async_trait]
impl Plugin for Recorder {
    async fn initialize(&mut self, _ctx: &ExecutionContext) -> Result<bool, PluginFault> {
        self.calls.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn execute(&mut self, operation: &str, params: Value) -> Result<Value, PluginFault> {
        self.calls.executed.fetch_add(1, Ordering::SeqCst);
        match operation {
            "echo" => Ok(params),
            "fail" => Err(PluginFault::new("asked to fail").with_code("E_FAIL")),
            other => Err(PluginFault::new(format!("unknown operation {other}"))),
        }
    }

    async fn cleanup(&mut self) -> Result<bool, PluginFault> {
        self.calls.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn supported_operations(&self) -> Vec<String> {
        vec!["echo".into(), "fail".into()]
    }

    fn status(&self) -> Value {
        json!({ "healthy": true })
    }
}

/// Manager rooted at `plugin_dir` with a `recorder` entry point.
pub async fn test_manager(plugin_dir: &Path) -> (PluginManager, Arc<Calls>) {
    let manager = PluginManager::with_defaults(ManagerConfig {
        plugin_dir: plugin_dir.to_path_buf(),
        ..Default::default()
    });
    let calls = Arc::new(Calls::default());
    let shared = calls.clone();
    manager
        .register_entry("recorder", move || {
            Box::new(Recorder {
                calls: shared.clone(),
            })
        })
        .await;
    (manager, calls)
}

pub async fn test_marketplace(plugin_dir: &Path) -> (Marketplace, Arc<Calls>) {
    let (manager, calls) = test_manager(plugin_dir).await;
    let registry = PluginRegistry::new(test_db().await);
    (Marketplace::new(Arc::new(registry), Arc::new(manager)), calls)
}

/// Write `<root>/<id>/plugin.toml` using the `recorder` entry point.
/// `extra` is appended inside the `[plugin]` table.
pub fn write_plugin(root: &Path, id: &str, extra: &str) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    let body = format!(
        "entry = \"recorder\"\n\n[plugin]\nid = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\n{extra}"
    );
    std::fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    dir
}

/// TOML for one `[[plugin.dependencies]]` item.
pub fn dependency(name: &str, kind: &str, optional: bool) -> String {
    format!("\n[[plugin.dependencies]]\nname = \"{name}\"\ntype = \"{kind}\"\noptional = {optional}\n")
}
