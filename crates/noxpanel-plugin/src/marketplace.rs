//! Marketplace service: browse, search, ratings, dependency reports and
//! the publish and install flows over the registry and the manager.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;

use crate::error::{PluginError, PluginResult};
use crate::manager::PluginManager;
use crate::manifest::DependencyKind;
use crate::registry::{
    PluginRegistry, PluginRegistryEntry, PluginStatistics, PluginStatus, SearchQuery,
    SearchResults, SortBy, SortOrder, VersionRecord,
};
use crate::resolver::{topological_order, ResolutionReport};
use crate::scanner::{PackageContents, SecurityScanResult, SecurityScanner};

// ─── Constants ──────────────────────────────────────────────────────────

/// Entries shown in the featured strip of a browse page.
const FEATURED_COUNT: usize = 5;

/// Maximum query suggestions returned with a search.
const MAX_SUGGESTIONS: usize = 5;

/// Maximum related plugins listed on a details page.
const MAX_RELATED: usize = 5;

/// Version records shown as recent history.
const RECENT_VERSIONS: usize = 5;

const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;

// ─── Views ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BrowsePage {
    pub entries: Vec<PluginRegistryEntry>,
    pub featured: Vec<PluginRegistryEntry>,
    /// Published plugin count per category.
    pub categories: BTreeMap<String, usize>,
    pub total: usize,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub results: SearchResults,
    pub suggestions: Vec<String>,
}

/// Whether a plugin can run on this host as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Compatibility {
    pub framework_compatible: bool,
    pub dependencies_satisfied: bool,
    pub sandbox_required: bool,
    pub requires_admin: bool,
    pub requires_network: bool,
    pub requires_filesystem: bool,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedPlugin {
    pub id: String,
    pub name: String,
    pub category: String,
    pub avg_rating: f64,
    pub shared_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginDetails {
    pub entry: PluginRegistryEntry,
    pub installation_steps: Vec<String>,
    pub compatibility: Compatibility,
    pub related: Vec<RelatedPlugin>,
    /// Newest first.
    pub recent_versions: Vec<VersionRecord>,
}

// ─── Marketplace ────────────────────────────────────────────────────────

pub struct Marketplace {
    registry: Arc<PluginRegistry>,
    manager: Arc<PluginManager>,
    scanner: SecurityScanner,
}

impl std::fmt::Debug for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marketplace").finish_non_exhaustive()
    }
}

impl Marketplace {
    pub fn new(registry: Arc<PluginRegistry>, manager: Arc<PluginManager>) -> Self {
        Self {
            registry,
            manager,
            scanner: SecurityScanner::new(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    // ── Browse & search ─────────────────────────────────────────────────

    /// One page of published plugins, most recently updated first. `page`
    /// is 1-based.
    pub async fn browse(&self, category: Option<&str>, page: u64, per_page: u64) -> PluginResult<BrowsePage> {
        let page = page.max(1);
        let per_page = match per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        };

        let listing = self
            .registry
            .search(&SearchQuery {
                category: category.map(str::to_string),
                sort_by: SortBy::Updated,
                sort_order: SortOrder::Desc,
                limit: per_page,
                offset: (page - 1) * per_page,
                ..Default::default()
            })
            .await?;

        let featured = self
            .registry
            .search(&SearchQuery {
                category: category.map(str::to_string),
                sort_by: SortBy::Downloads,
                sort_order: SortOrder::Desc,
                limit: FEATURED_COUNT as u64,
                ..Default::default()
            })
            .await?
            .entries;

        let mut categories = BTreeMap::new();
        for entry in self.registry.list(Some(PluginStatus::Published)).await? {
            *categories.entry(entry.category).or_insert(0) += 1;
        }

        let total = listing.total;
        Ok(BrowsePage {
            entries: listing.entries,
            featured,
            categories,
            total,
            page,
            per_page,
            total_pages: (total as u64).div_ceil(per_page),
        })
    }

    /// Search published plugins for `text`, narrowed by `filters`.
    pub async fn search(&self, text: &str, mut filters: SearchQuery) -> PluginResult<SearchPage> {
        let text = text.trim();
        filters.text = (!text.is_empty()).then(|| text.to_string());
        let results = self.registry.search(&filters).await?;
        let suggestions = self.suggestions(text).await?;
        Ok(SearchPage {
            results,
            suggestions,
        })
    }

    /// Names, ids, categories and tags of published plugins that start with
    /// the last word of `text`.
    async fn suggestions(&self, text: &str) -> PluginResult<Vec<String>> {
        let Some(prefix) = text.split_whitespace().last().map(str::to_lowercase) else {
            return Ok(Vec::new());
        };

        let mut found = BTreeSet::new();
        for entry in self.registry.list(Some(PluginStatus::Published)).await? {
            let candidates = [&entry.metadata.name, &entry.metadata.id, &entry.category]
                .into_iter()
                .chain(entry.tags.iter());
            for candidate in candidates {
                let lowered = candidate.to_lowercase();
                if lowered.starts_with(&prefix) && lowered != prefix {
                    found.insert(candidate.clone());
                }
            }
        }
        Ok(found.into_iter().take(MAX_SUGGESTIONS).collect())
    }

    // ── Details ─────────────────────────────────────────────────────────

    pub async fn get_details(&self, id: &str) -> PluginResult<PluginDetails> {
        let entry = self.registry.require(id).await?;
        let loaded = self.manager.loaded_versions().await;
        let report = self
            .manager
            .resolver()
            .resolve(&entry.metadata, &loaded)
            .await;

        let meta = &entry.metadata;
        let compatibility = Compatibility {
            framework_compatible: self.manager.resolver().check_framework(meta).is_ok(),
            dependencies_satisfied: report.success(),
            sandbox_required: meta.sandbox_required,
            requires_admin: meta.requires_admin,
            requires_network: meta.requires_network,
            requires_filesystem: meta.requires_filesystem,
            installed: loaded.contains_key(id),
        };

        let related = self.related(&entry).await?;
        let installation_steps = installation_steps(&entry);
        let recent_versions = entry
            .versions
            .iter()
            .rev()
            .take(RECENT_VERSIONS)
            .cloned()
            .collect();

        Ok(PluginDetails {
            entry,
            installation_steps,
            compatibility,
            related,
            recent_versions,
        })
    }

    /// Published plugins sharing the category or at least one tag, ranked by
    /// shared tags then rating.
    async fn related(&self, entry: &PluginRegistryEntry) -> PluginResult<Vec<RelatedPlugin>> {
        let mut related: Vec<RelatedPlugin> = self
            .registry
            .list(Some(PluginStatus::Published))
            .await?
            .into_iter()
            .filter(|other| other.id() != entry.id())
            .filter_map(|other| {
                let shared_tags: Vec<String> = other
                    .tags
                    .iter()
                    .filter(|t| entry.tags.iter().any(|own| own.eq_ignore_ascii_case(t)))
                    .cloned()
                    .collect();
                if other.category != entry.category && shared_tags.is_empty() {
                    return None;
                }
                Some(RelatedPlugin {
                    id: other.metadata.id,
                    name: other.metadata.name,
                    category: other.category,
                    avg_rating: other.statistics.avg_rating,
                    shared_tags,
                })
            })
            .collect();

        related.sort_by(|a, b| {
            b.shared_tags
                .len()
                .cmp(&a.shared_tags.len())
                .then(b.avg_rating.total_cmp(&a.avg_rating))
                .then_with(|| a.id.cmp(&b.id))
        });
        related.truncate(MAX_RELATED);
        Ok(related)
    }

    // ── Ratings ─────────────────────────────────────────────────────────

    /// Record `user_id`'s rating; the aggregate is recomputed from every
    /// stored rating.
    pub async fn add_rating(
        &self,
        id: &str,
        user_id: &str,
        rating: i32,
        review: &str,
    ) -> PluginResult<PluginStatistics> {
        self.registry.upsert_rating(id, user_id, rating, review).await
    }

    // ── Dependencies ────────────────────────────────────────────────────

    /// Check a catalog plugin's declared dependencies against this host and
    /// compute the order its plugin dependencies must be installed in.
    ///
    /// The install order covers the transitive plugin-dependency graph drawn
    /// from the registry, dependencies first and `id` last. A cycle fails
    /// with [`PluginError::DependencyCycle`].
    pub async fn resolve_dependencies(&self, id: &str) -> PluginResult<ResolutionReport> {
        let entry = self.registry.require(id).await?;
        let loaded = self.manager.loaded_versions().await;
        let mut report = self
            .manager
            .resolver()
            .resolve(&entry.metadata, &loaded)
            .await;

        let edges = self.dependency_graph(entry).await?;
        report.install_order = topological_order([id], &edges)?;

        tracing::debug!(
            plugin = %id,
            success = report.success(),
            missing = ?report.missing(),
            order = ?report.install_order,
            "dependencies resolved"
        );
        Ok(report)
    }

    /// Plugin-dependency edges reachable from `root`, restricted to
    /// plugins present in the catalog.
    async fn dependency_graph(&self, root: PluginRegistryEntry) -> PluginResult<HashMap<String, Vec<String>>> {
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut queue = VecDeque::from([root]);

        while let Some(entry) = queue.pop_front() {
            if edges.contains_key(entry.id()) {
                continue;
            }
            let mut deps = Vec::new();
            for dep in entry.metadata.plugin_dependencies() {
                if edges.contains_key(&dep.name) {
                    deps.push(dep.name.clone());
                    continue;
                }
                match self.registry.get(&dep.name).await? {
                    Some(next) => {
                        deps.push(dep.name.clone());
                        queue.push_back(next);
                    }
                    None => {
                        tracing::debug!(plugin = %entry.id(), dependency = %dep.name, "dependency not in catalog");
                    }
                }
            }
            edges.insert(entry.id().to_string(), deps);
        }

        Ok(edges)
    }

    // ── Publish & install ───────────────────────────────────────────────

    /// Scan an entry, store the result, and publish it if the scan allows.
    pub async fn publish(&self, id: &str, contents: Option<&PackageContents>) -> PluginResult<SecurityScanResult> {
        let entry = self.registry.require(id).await?;
        let scan = self.scanner.scan(&entry, contents);
        self.registry.store_scan_result(id, &scan).await?;

        if !scan.status.allows_publish() {
            tracing::warn!(plugin = %id, score = scan.score, status = ?scan.status, "publish refused by security scan");
            return Err(PluginError::Scan(format!(
                "plugin {id} scored {} ({:?}); {} issue(s) must be addressed before publishing",
                scan.score,
                scan.status,
                scan.issues.len()
            )));
        }

        self.registry.set_status(id, PluginStatus::Published).await?;
        tracing::info!(plugin = %id, score = scan.score, "plugin published");
        Ok(scan)
    }

    /// Load a catalog plugin and its plugin dependencies from the manager's
    /// plugin directory, dependencies first. Returns the ids newly loaded.
    /// If any step fails, the plugins this call loaded are unloaded again.
    pub async fn install(&self, id: &str, user_id: Option<&str>) -> PluginResult<Vec<String>> {
        let report = self.resolve_dependencies(id).await?;

        // Plugin dependencies in the install order are loaded below; anything
        // else missing blocks the install.
        let blocking: Vec<_> = report
            .missing_required
            .iter()
            .filter(|check| {
                check.dependency.kind != DependencyKind::Plugin
                    || !report.install_order.contains(&check.dependency.name)
            })
            .collect();
        if let Some(check) = blocking.first() {
            return Err(PluginError::Dependency {
                plugin: id.to_string(),
                dependency: check.dependency.name.clone(),
                reason: check
                    .reason
                    .clone()
                    .unwrap_or_else(|| "unavailable".to_string()),
            });
        }

        let mut installed: Vec<String> = Vec::new();
        for plugin_id in &report.install_order {
            if self.manager.is_loaded(plugin_id).await {
                continue;
            }
            let path = self.manager.plugin_dir().join(plugin_id);
            let step = match self.manager.load(&path, Map::new()).await {
                Ok(_) => self.registry.record_download(plugin_id, user_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                tracing::warn!(plugin = %plugin_id, requested_by = %id, "install failed, rolling back: {e}");
                // Loaded but not recorded.
                if self.manager.is_loaded(plugin_id).await {
                    if let Err(unload_err) = self.manager.unload(plugin_id).await {
                        tracing::warn!(plugin = %plugin_id, "rollback unload failed: {unload_err}");
                    }
                }
                self.roll_back(&installed).await;
                return Err(e);
            }
            tracing::info!(plugin = %plugin_id, requested_by = %id, "plugin installed");
            installed.push(plugin_id.clone());
        }
        Ok(installed)
    }

    /// Undo the plugins an install loaded, newest first. Failures are
    /// logged and the rest still rolled back.
    async fn roll_back(&self, installed: &[String]) {
        for plugin_id in installed.iter().rev() {
            if let Err(e) = self.manager.unload(plugin_id).await {
                tracing::warn!(plugin = %plugin_id, "rollback unload failed: {e}");
                continue;
            }
            if let Err(e) = self.registry.record_uninstall(plugin_id).await {
                tracing::warn!(plugin = %plugin_id, "rollback uninstall count failed: {e}");
            }
        }
    }

    /// Unload a plugin and count one fewer installation.
    pub async fn uninstall(&self, id: &str) -> PluginResult<()> {
        let was_loaded = self.manager.is_loaded(id).await;
        self.manager.unload(id).await?;
        if was_loaded {
            self.registry.record_uninstall(id).await?;
        }
        Ok(())
    }
}

/// Human-readable steps to get `entry` running on a host.
fn installation_steps(entry: &PluginRegistryEntry) -> Vec<String> {
    let meta = &entry.metadata;
    let mut steps = Vec::new();

    for dep in meta.dependencies.iter().filter(|d| !d.optional) {
        let what = match dep.kind {
            DependencyKind::Plugin => "plugin",
            DependencyKind::LanguagePackage => "package",
            DependencyKind::SystemBinary => "system binary",
            DependencyKind::Service => "service",
            DependencyKind::FrameworkFeature => "framework feature",
        };
        steps.push(format!(
            "Ensure {what} '{}' ({}) is available",
            dep.name, dep.version_requirement
        ));
    }

    steps.push(format!("Download {} {}", meta.name, entry.latest_version));
    if let Some(ref hash) = entry.package_hash {
        steps.push(format!("Verify the package SHA-256 matches {hash}"));
    }
    steps.push(format!("Extract the package into the plugin directory as '{}'", meta.id));
    if meta.requires_admin {
        steps.push("Start the plugin with administrator permission".to_string());
    } else {
        steps.push("Start the plugin".to_string());
    }
    steps
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{ExecutionContext, Plugin, PluginFault};
    use crate::manager::ManagerConfig;
    use crate::manifest::{PluginDependency, PluginMetadata, MANIFEST_FILE};
    use crate::scanner::ScanStatus;
    use async_trait::async_trait;
    use noxpanel_migration::MigratorTrait;
    use serde_json::Value;
    use std::path::Path;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn initialize(&mut self, _ctx: &ExecutionContext) -> Result<bool, PluginFault> {
            Ok(true)
        }

        async fn execute(&mut self, _op: &str, params: Value) -> Result<Value, PluginFault> {
            Ok(params)
        }

        async fn cleanup(&mut self) -> Result<bool, PluginFault> {
            Ok(true)
        }
    }

    async fn marketplace(plugin_dir: &Path) -> Marketplace {
        let db = noxpanel_db::connect(&noxpanel_db::DatabaseConfig::in_memory())
            .await
            .unwrap();
        noxpanel_migration::Migrator::up(&db, None).await.unwrap();

        let manager = PluginManager::with_defaults(ManagerConfig {
            plugin_dir: plugin_dir.to_path_buf(),
            ..Default::default()
        });
        manager.register_entry("noop", || Box::new(Noop)).await;
        Marketplace::new(Arc::new(PluginRegistry::new(db)), Arc::new(manager))
    }

    fn entry(id: &str, category: &str, deps: &[&str]) -> PluginRegistryEntry {
        let mut meta = PluginMetadata::inferred(id);
        meta.name = id.to_string();
        meta.version = "1.0.0".into();
        meta.description = format!("{id} for the panel");
        meta.author = "nox".into();
        meta.checksum = Some("a".repeat(64));
        meta.dependencies = deps
            .iter()
            .map(|d| PluginDependency::new(*d, DependencyKind::Plugin))
            .collect();
        let mut e = PluginRegistryEntry::new(meta, "pub-1");
        e.category = category.to_string();
        e.status = PluginStatus::Published;
        e
    }

    fn write_plugin_dir(root: &Path, id: &str, deps: &[&str]) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let mut body = format!(
            "entry = \"noop\"\n\n[plugin]\nid = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\n"
        );
        for dep in deps {
            body.push_str(&format!("\n[[plugin.dependencies]]\nname = \"{dep}\"\ntype = \"plugin\"\n"));
        }
        std::fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    // ── Browse & search ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_browse_paginates_and_features_top_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        for id in ["a-one", "b-two", "c-three"] {
            mp.registry().register(entry(id, "network", &[])).await.unwrap();
        }
        mp.registry().register(entry("d-four", "utility", &[])).await.unwrap();
        mp.registry().record_download("b-two", None).await.unwrap();
        mp.registry().record_download("b-two", None).await.unwrap();
        mp.registry().record_download("c-three", None).await.unwrap();

        let page = mp.browse(Some("network"), 1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.featured[0].id(), "b-two");
        assert_eq!(page.featured[1].id(), "c-three");
        assert_eq!(page.categories.get("network"), Some(&3));
        assert_eq!(page.categories.get("utility"), Some(&1));

        let page = mp.browse(Some("network"), 2, 2).await.unwrap();
        assert_eq!(page.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_search_returns_suggestions() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        let mut e = entry("netwatch", "network", &[]);
        e.tags = vec!["netflow".into()];
        mp.registry().register(e).await.unwrap();

        let page = mp.search("net", SearchQuery::default()).await.unwrap();
        assert_eq!(page.results.total, 1);
        assert!(page.suggestions.contains(&"netwatch".to_string()));
        assert!(page.suggestions.contains(&"netflow".to_string()));
        assert!(page.suggestions.contains(&"network".to_string()));

        let page = mp.search("", SearchQuery::default()).await.unwrap();
        assert_eq!(page.results.total, 1);
        assert!(page.suggestions.is_empty());
    }

    // ── Details ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_details_related_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;

        let mut main = entry("dns-watch", "network", &["resolver-lib"]);
        main.tags = vec!["dns".into()];
        mp.registry().register(main).await.unwrap();
        mp.registry().register(entry("port-scan", "network", &[])).await.unwrap();
        let mut tagged = entry("dns-cache", "utility", &[]);
        tagged.tags = vec!["dns".into()];
        mp.registry().register(tagged).await.unwrap();
        mp.registry().register(entry("log-view", "utility", &[])).await.unwrap();

        let mut next = mp.registry().require("dns-watch").await.unwrap();
        next.metadata.version = "1.1.0".into();
        mp.registry().update(next).await.unwrap();

        let details = mp.get_details("dns-watch").await.unwrap();
        let related: Vec<&str> = details.related.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(related, vec!["dns-cache", "port-scan"]);
        assert_eq!(details.recent_versions[0].version, "1.1.0");
        assert_eq!(details.recent_versions.len(), 2);
        assert!(!details.compatibility.dependencies_satisfied);
        assert!(!details.compatibility.installed);
        assert!(details.installation_steps[0].contains("resolver-lib"));

        assert!(matches!(
            mp.get_details("missing").await,
            Err(PluginError::NotFound(_))
        ));
    }

    // ── Dependencies ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_resolve_reports_missing_plugin_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        mp.registry().register(entry("app", "network", &["base"])).await.unwrap();
        mp.registry().register(entry("base", "network", &[])).await.unwrap();

        let report = mp.resolve_dependencies("app").await.unwrap();
        assert!(!report.success());
        assert_eq!(report.missing(), vec!["base"]);
        assert_eq!(report.install_order, vec!["base", "app"]);
    }

    #[tokio::test]
    async fn test_install_order_is_transitive() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        mp.registry().register(entry("app", "network", &["mid", "base"])).await.unwrap();
        mp.registry().register(entry("mid", "network", &["base"])).await.unwrap();
        mp.registry().register(entry("base", "network", &[])).await.unwrap();

        let report = mp.resolve_dependencies("app").await.unwrap();
        assert_eq!(report.install_order, vec!["base", "mid", "app"]);
    }

    #[tokio::test]
    async fn test_resolve_detects_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        mp.registry().register(entry("a", "network", &["b"])).await.unwrap();
        mp.registry().register(entry("b", "network", &["a"])).await.unwrap();

        let err = mp.resolve_dependencies("a").await.unwrap_err();
        match err {
            PluginError::DependencyCycle(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    // ── Publish & install ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_publish_stores_scan_and_publishes() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        let mut e = entry("clean", "utility", &[]);
        e.status = PluginStatus::Pending;
        mp.registry().register(e).await.unwrap();

        let scan = mp.publish("clean", None).await.unwrap();
        assert_eq!(scan.status, ScanStatus::Passed);
        let stored = mp.registry().require("clean").await.unwrap();
        assert_eq!(stored.status, PluginStatus::Published);
        assert_eq!(stored.security_scan.unwrap().scan_id, scan.scan_id);
        assert!(stored.published_at.is_some());
    }

    #[tokio::test]
    async fn test_publish_refused_on_failed_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let mp = marketplace(tmp.path()).await;
        let mut e = entry("risky", "utility", &[]);
        e.status = PluginStatus::Pending;
        mp.registry().register(e).await.unwrap();

        let source = "fn main() {\n    std::process::Command::new(\"sh\");\n    unsafe { libc::system(p) };\n    std::net::TcpStream::connect(a);\n    std::fs::remove_dir_all(d);\n}\n";
        let contents = PackageContents {
            sources: vec![("src/lib.rs".into(), source.into())],
            ..Default::default()
        };
        let err = mp.publish("risky", Some(&contents)).await.unwrap_err();
        assert!(matches!(err, PluginError::Scan(_)));

        let stored = mp.registry().require("risky").await.unwrap();
        assert_eq!(stored.status, PluginStatus::Pending);
        let scan = stored.security_scan.unwrap();
        assert!(!scan.status.allows_publish());
        assert!(scan.score < 60);
    }

    #[tokio::test]
    async fn test_install_loads_dependencies_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin_dir(tmp.path(), "base", &[]);
        write_plugin_dir(tmp.path(), "app", &["base"]);
        let mp = marketplace(tmp.path()).await;
        mp.registry().register(entry("app", "network", &["base"])).await.unwrap();
        mp.registry().register(entry("base", "network", &[])).await.unwrap();

        let installed = mp.install("app", Some("u1")).await.unwrap();
        assert_eq!(installed, vec!["base", "app"]);
        assert!(mp.manager().is_loaded("app").await);

        let base = mp.registry().require("base").await.unwrap();
        assert_eq!(base.statistics.download_count, 1);
        assert_eq!(base.statistics.active_installations, 1);

        // Second install is a no-op.
        assert!(mp.install("app", None).await.unwrap().is_empty());

        mp.uninstall("app").await.unwrap();
        mp.uninstall("app").await.unwrap();
        let app = mp.registry().require("app").await.unwrap();
        assert_eq!(app.statistics.active_installations, 0);
        assert_eq!(app.statistics.download_count, 1);
    }

    #[tokio::test]
    async fn test_install_blocked_by_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin_dir(tmp.path(), "needs-bin", &[]);
        let mp = marketplace(tmp.path()).await;
        let mut e = entry("needs-bin", "utility", &[]);
        e.metadata.dependencies = vec![PluginDependency::new(
            "definitely-not-a-binary-4c1e",
            DependencyKind::SystemBinary,
        )];
        mp.registry().register(e).await.unwrap();

        let err = mp.install("needs-bin", None).await.unwrap_err();
        assert!(matches!(err, PluginError::Dependency { .. }));
        assert!(!mp.manager().is_loaded("needs-bin").await);
    }
}
