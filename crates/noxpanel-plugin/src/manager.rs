//! Plugin manager: owns every loaded plugin and drives its lifecycle.
//!
//! The `PluginManager` discovers plugins on disk, gates them on their
//! dependencies, provisions sandboxes through the isolation backend and
//! dispatches operations. All state changes go through the lifecycle table
//! and are published to subscribers as [`LifecycleEvent`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};

use crate::error::{PluginError, PluginResult};
use crate::events::LifecycleEvent;
use crate::instance::{
    ExecutionContext, ExecutionResult, Plugin, PluginFault, PluginInfo, PluginInstance,
    PLUGIN_API_VERSION,
};
use crate::lifecycle::PluginState;
use crate::manifest::{DependencyKind, PluginManifest, PluginMetadata};
use crate::resolver::{topological_order, DependencyResolver, HostEnvironment};
use crate::sandbox::{
    Isolation, SandboxConfig, SandboxHandle, SandboxPermissions, SandboxTask, TaskIsolation,
    TaskOutput,
};

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─── Entry points ───────────────────────────────────────────────────────

/// Constructor registered by the host for one entry point.
pub type PluginConstructor = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Entry points the host knows how to instantiate.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    constructors: HashMap<String, PluginConstructor>,
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("entries", &self.entries())
            .finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, entry: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.constructors.insert(entry.into(), Arc::new(constructor));
    }

    pub fn get(&self, entry: &str) -> Option<PluginConstructor> {
        self.constructors.get(entry).cloned()
    }

    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.constructors.keys().cloned().collect();
        entries.sort();
        entries
    }
}

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root directory holding one sub-directory per plugin.
    pub plugin_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub environment: HostEnvironment,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("/data/plugins"),
            sandbox: SandboxConfig::default(),
            environment: HostEnvironment::default(),
        }
    }
}

impl ManagerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            plugin_dir: PathBuf::from(
                std::env::var("PLUGIN_DIR").unwrap_or_else(|_| "/data/plugins".to_string()),
            ),
            sandbox: SandboxConfig::from_env(),
            environment: HostEnvironment::from_env(),
        }
    }
}

/// Manager-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub loaded_plugins: usize,
    pub active_plugins: usize,
    pub total_executions: u64,
    pub failed_executions: u64,
}

/// A plugin found on disk, ready to be registered.
struct Discovered {
    dir: PathBuf,
    metadata: PluginMetadata,
    defaults: Map<String, Value>,
    plugin: Box<dyn Plugin>,
}

// ─── Manager ────────────────────────────────────────────────────────────

pub struct PluginManager {
    config: ManagerConfig,
    catalog: RwLock<PluginCatalog>,
    resolver: DependencyResolver,
    isolation: Arc<dyn Isolation>,
    /// Loaded plugins indexed by plugin id.
    plugins: RwLock<HashMap<String, Arc<Mutex<PluginInstance>>>>,
    /// Metadata of loaded plugins, readable without locking an instance.
    metadata: RwLock<HashMap<String, PluginMetadata>>,
    /// Serializes adding and removing plugins.
    structure: Mutex<()>,
    loaded_plugins: AtomicUsize,
    active_plugins: AtomicUsize,
    total_executions: AtomicU64,
    failed_executions: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(config: ManagerConfig, isolation: Arc<dyn Isolation>) -> Self {
        let resolver = DependencyResolver::new(config.environment.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            catalog: RwLock::new(PluginCatalog::new()),
            resolver,
            isolation,
            plugins: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            structure: Mutex::new(()),
            loaded_plugins: AtomicUsize::new(0),
            active_plugins: AtomicUsize::new(0),
            total_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            events,
        }
    }

    /// Manager with the in-process isolation backend.
    pub fn with_defaults(config: ManagerConfig) -> Self {
        Self::new(config, Arc::new(TaskIsolation))
    }

    pub fn with_resolver(mut self, resolver: DependencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.config.plugin_dir
    }

    /// Register a constructor for an entry point.
    pub async fn register_entry<F>(&self, entry: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let entry = entry.into();
        tracing::debug!(entry = %entry, "plugin entry point registered");
        self.catalog.write().await.register(entry, constructor);
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    // ── Loading ─────────────────────────────────────────────────────────

    /// Load the plugin in `path`.
    ///
    /// Returns the plugin id. Loading an id that is already loaded is a
    /// no-op. On failure nothing is registered.
    pub async fn load(
        &self,
        path: impl AsRef<Path>,
        configuration: Map<String, Value>,
    ) -> PluginResult<String> {
        let discovered = self.discover(path.as_ref()).await?;
        self.register_discovered(discovered, configuration).await
    }

    async fn discover(&self, dir: &Path) -> PluginResult<Discovered> {
        let is_dir = tokio::fs::metadata(dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(PluginError::Discovery(format!(
                "{} is not a plugin directory",
                dir.display()
            )));
        }

        let dir_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PluginError::Discovery(format!("{} has no usable directory name", dir.display()))
            })?
            .to_string();

        let manifest = PluginManifest::read_from_dir(dir).await?;
        let entry = manifest
            .as_ref()
            .and_then(|m| m.entry.clone())
            .unwrap_or_else(|| dir_name.clone());

        let constructor = self.catalog.read().await.get(&entry).ok_or_else(|| {
            PluginError::Import(format!("no entry point registered under '{entry}'"))
        })?;
        let plugin = constructor();

        let (metadata, defaults) = match manifest {
            Some(manifest) => (manifest.plugin, manifest.defaults),
            None => {
                let metadata = match plugin.describe() {
                    Some(described) => described,
                    None => {
                        tracing::info!(
                            plugin = %dir_name,
                            "no plugin.toml found, inferring default manifest"
                        );
                        PluginMetadata::inferred(dir_name.clone())
                    }
                };
                metadata.validate().map_err(|e| {
                    PluginError::Discovery(format!("{}: {e}", dir.display()))
                })?;
                (metadata, Map::new())
            }
        };

        Ok(Discovered {
            dir: dir.to_path_buf(),
            metadata,
            defaults,
            plugin,
        })
    }

    async fn register_discovered(
        &self,
        discovered: Discovered,
        configuration: Map<String, Value>,
    ) -> PluginResult<String> {
        let Discovered {
            dir,
            metadata,
            defaults,
            plugin,
        } = discovered;
        let id = metadata.id.clone();

        let _structure = self.structure.lock().await;

        if self.plugins.read().await.contains_key(&id) {
            tracing::debug!(plugin = %id, "plugin already loaded");
            return Ok(id);
        }

        if plugin.api_version() != PLUGIN_API_VERSION {
            return Err(PluginError::Interface(format!(
                "plugin {id} implements contract v{} but the host speaks v{PLUGIN_API_VERSION}",
                plugin.api_version()
            )));
        }

        self.resolver.check_framework(&metadata)?;

        let loaded = self.loaded_versions().await;
        let report = self.resolver.resolve(&metadata, &loaded).await;
        let warnings = report.warnings();
        if let Some(err) = report.into_error() {
            tracing::warn!(plugin = %id, "dependency check failed: {err}");
            return Err(err);
        }

        let mut merged = defaults;
        merged.extend(configuration);
        let problems = plugin.validate_configuration(&merged);
        if !problems.is_empty() {
            return Err(PluginError::InvalidConfiguration {
                plugin: id,
                problems,
            });
        }

        let mut instance = PluginInstance::new(metadata.clone(), plugin, merged).with_source(dir);
        for warning in warnings {
            instance.add_warning(warning);
        }
        self.step(&mut instance, PluginState::Loading)?;
        self.step(&mut instance, PluginState::Loaded)?;

        self.metadata.write().await.insert(id.clone(), metadata.clone());
        self.plugins
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(instance)));
        self.loaded_plugins.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            plugin = %id,
            version = %metadata.version,
            plugin_type = metadata.plugin_type.as_str(),
            "plugin loaded"
        );

        Ok(id)
    }

    /// Load every plugin directory under `root` in dependency order.
    ///
    /// Per-plugin failures are logged and reported in the result; only a
    /// dependency cycle or an unreadable root fails the whole call.
    pub async fn load_all(
        &self,
        root: impl AsRef<Path>,
    ) -> PluginResult<Vec<(String, PluginResult<String>)>> {
        let root = root.as_ref();
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut outcomes = Vec::new();
        let mut found: HashMap<String, Discovered> = HashMap::new();
        for dir in dirs {
            let label = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.discover(&dir).await {
                Ok(d) => {
                    found.insert(d.metadata.id.clone(), d);
                }
                Err(e) => {
                    tracing::warn!(plugin = %label, "skipping plugin directory: {e}");
                    outcomes.push((label, Err(e)));
                }
            }
        }

        let edges: HashMap<String, Vec<String>> = found
            .iter()
            .map(|(id, d)| {
                let deps = d
                    .metadata
                    .dependencies
                    .iter()
                    .filter(|dep| dep.kind == DependencyKind::Plugin)
                    .filter(|dep| found.contains_key(&dep.name))
                    .map(|dep| dep.name.clone())
                    .collect();
                (id.clone(), deps)
            })
            .collect();

        let mut ids: Vec<&str> = found.keys().map(String::as_str).collect();
        ids.sort_unstable();
        let order = topological_order(ids, &edges)?;

        for id in order {
            let Some(discovered) = found.remove(&id) else {
                continue;
            };
            let result = self.register_discovered(discovered, Map::new()).await;
            if let Err(ref e) = result {
                tracing::warn!(plugin = %id, "failed to load plugin: {e}");
            }
            outcomes.push((id, result));
        }

        Ok(outcomes)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start a loaded plugin. Already active plugins are left untouched.
    pub async fn start(&self, id: &str, context: Option<ExecutionContext>) -> PluginResult<()> {
        let mut guard = self.lock_instance(id).await?;
        let inst: &mut PluginInstance = &mut guard;

        if inst.state() == PluginState::Active {
            return Ok(());
        }

        if inst.state().needs_reload() {
            self.step(inst, PluginState::Loading)?;
            self.step(inst, PluginState::Loaded)?;
        }

        let mut context = context.unwrap_or_else(|| ExecutionContext::new(id));
        context.plugin_id = id.to_string();
        for (key, value) in inst.configuration() {
            context
                .configuration
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        if inst.metadata().requires_admin && !context.is_admin() {
            let err = PluginError::Privilege(id.to_string());
            self.fail(inst, &err.to_string());
            return Err(err);
        }

        self.step(inst, PluginState::Initializing)?;

        let mut sandbox: Option<Box<dyn SandboxHandle>> = None;
        if inst.metadata().sandbox_required {
            let limits = self.config.sandbox.limits_for(inst.metadata());
            let permissions = SandboxPermissions::for_plugin(inst.metadata());
            match self.isolation.create_sandbox(id, limits, permissions).await {
                Ok(handle) => {
                    context.sandbox_id = Some(handle.id().to_string());
                    sandbox = Some(handle);
                }
                Err(e) => {
                    let err = PluginError::Initialization {
                        plugin: id.to_string(),
                        reason: format!("sandbox provisioning failed: {e}"),
                    };
                    self.fail(inst, &err.to_string());
                    return Err(err);
                }
            }
        }

        let started = Instant::now();
        let plugin = &mut inst.plugin;
        let ctx = &context;
        let outcome = run_task(
            sandbox.as_deref(),
            Box::pin(async move { plugin.initialize(ctx).await.map(Value::Bool) }),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Value::Bool(true))) => None,
            Ok(Ok(_)) => Some("initialize returned false".to_string()),
            Ok(Err(fault)) => Some(fault.to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            if let Some(sandbox) = sandbox {
                if let Err(e) = sandbox.teardown().await {
                    tracing::warn!(plugin = %id, "sandbox teardown failed: {e}");
                }
            }
            let err = PluginError::Initialization {
                plugin: id.to_string(),
                reason,
            };
            self.fail(inst, &err.to_string());
            return Err(err);
        }

        inst.sandbox = sandbox;
        inst.mark_started(context);
        self.step(inst, PluginState::Active)?;

        tracing::info!(
            plugin = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            sandboxed = inst.sandbox.is_some(),
            "plugin started"
        );
        Ok(())
    }

    /// Stop an active plugin. Plugins that are not active are left untouched.
    pub async fn stop(&self, id: &str) -> PluginResult<()> {
        let mut guard = self.lock_instance(id).await?;
        if guard.state() != PluginState::Active {
            return Ok(());
        }
        self.stop_locked(&mut guard).await
    }

    async fn stop_locked(&self, inst: &mut PluginInstance) -> PluginResult<()> {
        self.step(inst, PluginState::Stopping)?;
        self.cleanup_best_effort(inst).await;
        self.teardown_sandbox(inst).await;
        inst.clear_activation();
        self.step(inst, PluginState::Stopped)?;
        tracing::info!(plugin = %inst.id(), "plugin stopped");
        Ok(())
    }

    /// Remove a plugin from the manager, stopping it first if needed.
    /// Unloading an id that is not loaded succeeds.
    pub async fn unload(&self, id: &str) -> PluginResult<()> {
        let _structure = self.structure.lock().await;

        let Some(handle) = self.plugins.read().await.get(id).cloned() else {
            tracing::debug!(plugin = %id, "unload requested for plugin that is not loaded");
            return Ok(());
        };

        {
            let mut guard = handle.lock().await;
            let inst: &mut PluginInstance = &mut guard;
            if inst.state() == PluginState::Active {
                if let Err(e) = self.stop_locked(inst).await {
                    tracing::warn!(plugin = %id, "stop during unload failed: {e}");
                }
            }
            self.cleanup_best_effort(inst).await;
            self.teardown_sandbox(inst).await;
            if inst.state() == PluginState::Active {
                self.active_plugins.fetch_sub(1, Ordering::Relaxed);
            }

            // Leave the maps before releasing the instance lock so a caller
            // queued on it cannot act on a removed plugin.
            inst.detach();
            if self.plugins.write().await.remove(id).is_some() {
                self.loaded_plugins.fetch_sub(1, Ordering::Relaxed);
            }
            self.metadata.write().await.remove(id);
            self.emit(LifecycleEvent::unloaded(id, inst.state()));
        }

        tracing::info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    /// Unload and load again from the recorded source directory, keeping
    /// the configuration.
    pub async fn reload(&self, id: &str) -> PluginResult<String> {
        let (source, configuration) = {
            let guard = self.lock_instance(id).await?;
            let source = guard.source().cloned().ok_or_else(|| {
                PluginError::Discovery(format!("plugin {id} has no recorded source directory"))
            })?;
            (source, guard.configuration().clone())
        };

        self.unload(id).await?;
        self.load(&source, configuration).await
    }

    /// Take a plugin out of service until it is enabled again.
    pub async fn disable(&self, id: &str) -> PluginResult<()> {
        let mut guard = self.lock_instance(id).await?;
        let inst: &mut PluginInstance = &mut guard;

        match inst.state() {
            PluginState::Disabled => return Ok(()),
            PluginState::Active => {
                self.cleanup_best_effort(inst).await;
                self.teardown_sandbox(inst).await;
                inst.clear_activation();
            }
            _ => {}
        }
        self.step(inst, PluginState::Disabled)?;
        tracing::info!(plugin = %id, "plugin disabled");
        Ok(())
    }

    /// Bring a disabled plugin back to `Loaded`.
    pub async fn enable(&self, id: &str) -> PluginResult<()> {
        let mut guard = self.lock_instance(id).await?;
        let inst: &mut PluginInstance = &mut guard;

        if inst.state() != PluginState::Disabled {
            return Ok(());
        }
        self.step(inst, PluginState::Loading)?;
        self.step(inst, PluginState::Loaded)?;
        tracing::info!(plugin = %id, "plugin enabled");
        Ok(())
    }

    /// Unload every plugin, best-effort.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        tracing::info!(count = ids.len(), "shutting down plugin manager");
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                tracing::error!(plugin = %id, "failed to unload plugin during shutdown: {e}");
            }
        }
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Run `operation` on an active plugin.
    ///
    /// Plugin failures come back as an unsuccessful [`ExecutionResult`];
    /// `Err` is reserved for plugins that are missing or not active.
    pub async fn execute(
        &self,
        id: &str,
        operation: &str,
        params: Value,
    ) -> PluginResult<ExecutionResult> {
        let mut guard = self.lock_instance(id).await?;
        let inst: &mut PluginInstance = &mut guard;

        if inst.state() != PluginState::Active {
            return Err(PluginError::NotActive {
                plugin: id.to_string(),
                state: inst.state(),
            });
        }

        let started = Instant::now();
        let plugin = &mut inst.plugin;
        let outcome = run_task(
            inst.sandbox.as_deref(),
            Box::pin(async move { plugin.execute(operation, params).await }),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.total_executions.fetch_add(1, Ordering::Relaxed);

        let (fault, err) = match outcome {
            Ok(Ok(value)) => {
                inst.record_execution(true);
                tracing::debug!(plugin = %id, operation = %operation, elapsed_ms, "operation executed");
                return Ok(ExecutionResult::ok(id, operation, value, elapsed_ms));
            }
            Ok(Err(fault)) => (
                fault.clone(),
                PluginError::Execution {
                    plugin: id.to_string(),
                    reason: fault.message,
                },
            ),
            Err(e) => (PluginFault::new(e.to_string()).with_code(e.kind()), e),
        };

        inst.record_execution(false);
        self.failed_executions.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            plugin = %id,
            operation = %operation,
            elapsed_ms,
            "operation failed: {err}"
        );
        let data = inst.plugin.handle_error(operation, &fault);
        Ok(ExecutionResult::failed(id, operation, &err, data, elapsed_ms))
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub async fn state(&self, id: &str) -> Option<PluginState> {
        let handle = self.plugins.read().await.get(id).cloned()?;
        let guard = handle.lock().await;
        if guard.is_detached() {
            return None;
        }
        Some(guard.state())
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    pub async fn info(&self, id: &str) -> PluginResult<PluginInfo> {
        let info = self.lock_instance(id).await?.info();
        Ok(info)
    }

    /// Snapshot of every loaded plugin, ordered by id.
    pub async fn list(&self) -> Vec<PluginInfo> {
        let handles: Vec<Arc<Mutex<PluginInstance>>> =
            self.plugins.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            let guard = handle.lock().await;
            if !guard.is_detached() {
                infos.push(guard.info());
            }
        }
        infos.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        infos
    }

    pub async fn supported_operations(&self, id: &str) -> PluginResult<Vec<String>> {
        let operations = self.lock_instance(id).await?.plugin.supported_operations();
        Ok(operations)
    }

    pub async fn metadata(&self, id: &str) -> Option<PluginMetadata> {
        self.metadata.read().await.get(id).cloned()
    }

    /// Loaded plugin ids mapped to their versions.
    pub async fn loaded_versions(&self) -> HashMap<String, String> {
        self.metadata
            .read()
            .await
            .iter()
            .map(|(id, meta)| (id.clone(), meta.version.clone()))
            .collect()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            loaded_plugins: self.loaded_plugins.load(Ordering::Relaxed),
            active_plugins: self.active_plugins.load(Ordering::Relaxed),
            total_executions: self.total_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn instance(&self, id: &str) -> PluginResult<Arc<Mutex<PluginInstance>>> {
        self.plugins
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotLoaded(id.to_string()))
    }

    /// Lock a loaded instance. An instance unloaded while the caller waited
    /// for the lock reports as not loaded.
    async fn lock_instance(&self, id: &str) -> PluginResult<OwnedMutexGuard<PluginInstance>> {
        let guard = self.instance(id).await?.lock_owned().await;
        if guard.is_detached() {
            return Err(PluginError::NotLoaded(id.to_string()));
        }
        Ok(guard)
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn step(&self, inst: &mut PluginInstance, to: PluginState) -> PluginResult<()> {
        let from = inst.transition(to)?;
        self.track_active(from, to);
        self.emit(LifecycleEvent::transition(inst.id(), from, to));
        Ok(())
    }

    fn fail(&self, inst: &mut PluginInstance, reason: &str) {
        if let Some(from) = inst.fail(reason) {
            self.track_active(from, PluginState::Error);
            self.emit(
                LifecycleEvent::transition(inst.id(), from, PluginState::Error).with_detail(reason),
            );
        }
    }

    fn track_active(&self, from: PluginState, to: PluginState) {
        if to == PluginState::Active {
            self.active_plugins.fetch_add(1, Ordering::Relaxed);
        } else if from == PluginState::Active {
            self.active_plugins.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn cleanup_best_effort(&self, inst: &mut PluginInstance) {
        let id = inst.id().to_string();
        let plugin = &mut inst.plugin;
        let outcome = run_task(
            inst.sandbox.as_deref(),
            Box::pin(async move { plugin.cleanup().await.map(Value::Bool) }),
        )
        .await;
        match outcome {
            Ok(Ok(Value::Bool(true))) => {}
            Ok(Ok(_)) => tracing::warn!(plugin = %id, "cleanup reported failure"),
            Ok(Err(fault)) => tracing::warn!(plugin = %id, "cleanup failed: {fault}"),
            Err(e) => tracing::error!(plugin = %id, "cleanup could not run: {e}"),
        }
    }

    async fn teardown_sandbox(&self, inst: &mut PluginInstance) {
        if let Some(sandbox) = inst.sandbox.take() {
            if let Err(e) = sandbox.teardown().await {
                tracing::warn!(plugin = %inst.id(), sandbox = %sandbox.id(), "sandbox teardown failed: {e}");
            }
        }
    }
}

/// Run a plugin call inside the sandbox when one is provisioned.
async fn run_task(sandbox: Option<&dyn SandboxHandle>, task: SandboxTask<'_>) -> PluginResult<TaskOutput> {
    match sandbox {
        Some(sandbox) => sandbox.run(task).await,
        None => Ok(task.await),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILE;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Echo {
        cleanups: Arc<AtomicUsize>,
        refuse_init: bool,
    }

    #[async_trait]
    impl Plugin for Echo {
        async fn initialize(&mut self, _ctx: &ExecutionContext) -> Result<bool, PluginFault> {
            Ok(!self.refuse_init)
        }

        async fn execute(&mut self, op: &str, params: Value) -> Result<Value, PluginFault> {
            match op {
                "echo" => Ok(params),
                "count" => Ok(json!(3)),
                _ => Err(PluginFault::new(format!("unknown operation {op}")).with_code("E_OP")),
            }
        }

        async fn cleanup(&mut self) -> Result<bool, PluginFault> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn supported_operations(&self) -> Vec<String> {
            vec!["echo".into(), "count".into()]
        }
    }

    fn write_manifest(root: &Path, dir: &str, body: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE), body).unwrap();
        path
    }

    fn manifest(id: &str, extra: &str) -> String {
        format!("entry = \"echo\"\n\n[plugin]\nid = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\n{extra}")
    }

    async fn manager() -> PluginManager {
        let manager = PluginManager::with_defaults(ManagerConfig::default());
        manager.register_entry("echo", || Box::new(Echo::default())).await;
        manager
    }

    // ── Catalog and config ──────────────────────────────────────────────

    #[test]
    fn test_catalog_register_and_get() {
        let mut catalog = PluginCatalog::new();
        catalog.register("b", || Box::new(Echo::default()));
        catalog.register("a", || Box::new(Echo::default()));
        assert!(catalog.get("a").is_some());
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.entries(), vec!["a", "b"]);
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.plugin_dir, PathBuf::from("/data/plugins"));
        assert_eq!(config.sandbox.execution_timeout_secs, 30);
    }

    // ── Load / start / execute ──────────────────────────────────────────

    #[tokio::test]
    async fn test_load_start_execute_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;

        let id = manager.load(&dir, Map::new()).await.unwrap();
        assert_eq!(id, "echo-one");
        assert_eq!(manager.state(&id).await, Some(PluginState::Loaded));

        manager.start(&id, None).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Active));
        assert_eq!(manager.stats().active_plugins, 1);

        let res = manager.execute(&id, "echo", json!({"x": 1})).await.unwrap();
        assert!(res.success);
        assert_eq!(res.data["x"], 1);

        let res = manager.execute(&id, "count", json!(null)).await.unwrap();
        assert_eq!(res.data["result"], 3);

        manager.stop(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Stopped));

        let stats = manager.stats();
        assert_eq!(stats.loaded_plugins, 1);
        assert_eq!(stats.active_plugins, 0);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.failed_executions, 0);
    }

    #[tokio::test]
    async fn test_execute_fault_becomes_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();

        let res = manager.execute(&id, "explode", json!({})).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.error_kind.as_deref(), Some("execution"));
        assert_eq!(res.data["code"], "E_OP");

        let info = manager.info(&id).await.unwrap();
        assert_eq!(info.execution_count, 1);
        assert_eq!(info.error_count, 1);
        assert_eq!(manager.stats().failed_executions, 1);
    }

    #[tokio::test]
    async fn test_execute_requires_active() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();

        let err = manager.execute(&id, "echo", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::NotActive {
                state: PluginState::Loaded,
                ..
            }
        ));

        let err = manager.execute("ghost", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, PluginError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        manager.load(&dir, Map::new()).await.unwrap();
        manager.load(&dir, Map::new()).await.unwrap();
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_load_without_entry_point_fails_with_import() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(
            tmp.path(),
            "orphan",
            "entry = \"nobody\"\n[plugin]\nid = \"orphan\"\nname = \"o\"\nversion = \"1.0.0\"\n",
        );
        let manager = manager().await;
        let err = manager.load(&dir, Map::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Import(_)));
        assert!(!manager.is_loaded("orphan").await);
    }

    #[tokio::test]
    async fn test_load_missing_directory_fails_with_discovery() {
        let manager = manager().await;
        let err = manager
            .load("/nonexistent/plugins/ghost", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_load_infers_manifest_from_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("echo");
        std::fs::create_dir_all(&dir).unwrap();
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();
        assert_eq!(id, "echo");
        let meta = manager.metadata("echo").await.unwrap();
        assert_eq!(meta.version, "0.1.0");
    }

    #[tokio::test]
    async fn test_defaults_merge_under_caller_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let body = format!(
            "{}\n[defaults]\ninterval = 30\nmode = \"passive\"\n",
            manifest("echo-one", "")
        );
        let dir = write_manifest(tmp.path(), "echo-one", &body);
        let manager = manager().await;
        let mut config = Map::new();
        config.insert("mode".into(), json!("active"));
        let id = manager.load(&dir, config).await.unwrap();

        manager.start(&id, None).await.unwrap();
        let handle = manager.instance(&id).await.unwrap();
        let guard = handle.lock().await;
        assert_eq!(guard.configuration()["interval"], 30);
        assert_eq!(guard.configuration()["mode"], "active");
        assert_eq!(guard.context().unwrap().configuration["mode"], "active");
    }

    // ── Start failures ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_initialize_false_moves_to_error() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = PluginManager::with_defaults(ManagerConfig::default());
        manager
            .register_entry("echo", || {
                Box::new(Echo {
                    refuse_init: true,
                    ..Default::default()
                })
            })
            .await;
        let dir = write_manifest(tmp.path(), "stubborn", &manifest("stubborn", ""));
        let id = manager.load(&dir, Map::new()).await.unwrap();

        let err = manager.start(&id, None).await.unwrap_err();
        assert!(matches!(err, PluginError::Initialization { .. }));
        assert_eq!(manager.state(&id).await, Some(PluginState::Error));
        assert!(manager.info(&id).await.unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_admin_plugin_requires_admin_context() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(
            tmp.path(),
            "root-tool",
            &manifest("root-tool", "requires_admin = true\n"),
        );
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();

        let err = manager.start(&id, None).await.unwrap_err();
        assert!(matches!(err, PluginError::Privilege(_)));
        assert_eq!(manager.state(&id).await, Some(PluginState::Error));

        let ctx = ExecutionContext::new(&id).with_permission(crate::instance::ADMIN_PERMISSION);
        manager.start(&id, Some(ctx)).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Active));
    }

    #[tokio::test]
    async fn test_sandboxed_plugin_gets_sandbox_id() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(
            tmp.path(),
            "boxed",
            &manifest("boxed", "sandbox_required = true\n"),
        );
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();

        let info = manager.info(&id).await.unwrap();
        assert!(info.sandbox_id.as_deref().unwrap().starts_with("sbx-"));
        let res = manager.execute(&id, "echo", json!({"ok": true})).await.unwrap();
        assert!(res.success);

        manager.stop(&id).await.unwrap();
        assert!(manager.info(&id).await.unwrap().sandbox_id.is_none());
    }

    // ── Unload / reload / disable ───────────────────────────────────────

    #[tokio::test]
    async fn test_unload_twice_succeeds_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let manager = PluginManager::with_defaults(ManagerConfig::default());
        manager
            .register_entry("echo", move || {
                Box::new(Echo {
                    cleanups: counter.clone(),
                    ..Default::default()
                })
            })
            .await;

        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();
        manager.unload(&id).await.unwrap();
        manager.unload(&id).await.unwrap();

        assert!(!manager.is_loaded(&id).await);
        // stop cleanup plus the unload pass
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().active_plugins, 0);
        assert_eq!(manager.stats().loaded_plugins, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let mut events = manager.subscribe();
        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();
        manager.stop(&id).await.unwrap();
        manager.start(&id, None).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Active));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.to.unwrap());
        }
        use PluginState::*;
        assert_eq!(
            seen,
            vec![
                Loading, Loaded, Initializing, Active, Stopping, Stopped, Loading, Loaded,
                Initializing, Active
            ]
        );
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();

        manager.disable(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Disabled));
        assert_eq!(manager.stats().active_plugins, 0);

        let err = manager.start(&id, None).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidTransition { .. }));
        assert_eq!(manager.state(&id).await, Some(PluginState::Disabled));

        manager.enable(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Loaded));
        manager.start(&id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_keeps_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let mut config = Map::new();
        config.insert("level".into(), json!(2));
        let id = manager.load(&dir, config).await.unwrap();
        manager.start(&id, None).await.unwrap();

        manager.reload(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, Some(PluginState::Loaded));
        let handle = manager.instance(&id).await.unwrap();
        assert_eq!(handle.lock().await.configuration()["level"], 2);
    }

    // ── Dependencies ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_missing_required_plugin_dependency_blocks_load() {
        let tmp = tempfile::tempdir().unwrap();
        let body = manifest(
            "app",
            "\n[[plugin.dependencies]]\nname = \"core-lib\"\ntype = \"plugin\"\n",
        );
        let dir = write_manifest(tmp.path(), "app", &body);
        let manager = manager().await;
        let err = manager.load(&dir, Map::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Dependency { ref dependency, .. } if dependency == "core-lib"));
        assert!(!manager.is_loaded("app").await);
    }

    #[tokio::test]
    async fn test_load_all_orders_by_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            tmp.path(),
            "a-app",
            &manifest(
                "a-app",
                "\n[[plugin.dependencies]]\nname = \"z-core\"\ntype = \"plugin\"\nversion_requirement = \"^1\"\n",
            ),
        );
        write_manifest(tmp.path(), "z-core", &manifest("z-core", ""));
        std::fs::write(tmp.path().join("README.txt"), "not a plugin").unwrap();

        let manager = manager().await;
        let outcomes = manager.load_all(tmp.path()).await.unwrap();
        let ids: Vec<&str> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["z-core", "a-app"]);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    }

    #[tokio::test]
    async fn test_load_all_reports_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        let dep = |name: &str| format!("\n[[plugin.dependencies]]\nname = \"{name}\"\n");
        write_manifest(tmp.path(), "p-one", &manifest("p-one", &dep("p-two")));
        write_manifest(tmp.path(), "p-two", &manifest("p-two", &dep("p-one")));

        let manager = manager().await;
        let err = manager.load_all(tmp.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::DependencyCycle(_)));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "one", &manifest("one", ""));
        write_manifest(tmp.path(), "two", &manifest("two", ""));
        let manager = manager().await;
        manager.load_all(tmp.path()).await.unwrap();
        manager.start("one", None).await.unwrap();

        manager.shutdown().await;
        assert!(manager.list().await.is_empty());
        assert_eq!(manager.stats(), ManagerStats::default());
    }

    #[tokio::test]
    async fn test_supported_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_manifest(tmp.path(), "echo-one", &manifest("echo-one", ""));
        let manager = manager().await;
        let id = manager.load(&dir, Map::new()).await.unwrap();
        assert_eq!(
            manager.supported_operations(&id).await.unwrap(),
            vec!["echo", "count"]
        );
    }

    #[tokio::test]
    async fn test_invalid_configuration_blocks_load() {
        struct Picky;

        #[async_trait]
        impl Plugin for Picky {
            async fn initialize(&mut self, _: &ExecutionContext) -> Result<bool, PluginFault> {
                Ok(true)
            }
            async fn execute(&mut self, _: &str, _: Value) -> Result<Value, PluginFault> {
                Ok(Value::Null)
            }
            async fn cleanup(&mut self) -> Result<bool, PluginFault> {
                Ok(true)
            }
            fn validate_configuration(&self, config: &Map<String, Value>) -> Vec<String> {
                if config.contains_key("target") {
                    Vec::new()
                } else {
                    vec!["target is required".into()]
                }
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("picky");
        std::fs::create_dir_all(&dir).unwrap();
        let manager = PluginManager::with_defaults(ManagerConfig::default());
        manager.register_entry("picky", || Box::new(Picky)).await;

        let err = manager.load(&dir, Map::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfiguration { .. }));

        let mut config = Map::new();
        config.insert("target".into(), json!("10.0.0.1"));
        manager.load(&dir, config).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_fault_does_not_block_stop() {
        struct Messy(Arc<AtomicBool>);

        #[async_trait]
        impl Plugin for Messy {
            async fn initialize(&mut self, _: &ExecutionContext) -> Result<bool, PluginFault> {
                Ok(true)
            }
            async fn execute(&mut self, _: &str, _: Value) -> Result<Value, PluginFault> {
                Ok(Value::Null)
            }
            async fn cleanup(&mut self) -> Result<bool, PluginFault> {
                self.0.store(true, Ordering::SeqCst);
                Err(PluginFault::new("socket already closed"))
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("messy");
        std::fs::create_dir_all(&dir).unwrap();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let manager = PluginManager::with_defaults(ManagerConfig::default());
        manager
            .register_entry("messy", move || Box::new(Messy(flag.clone())))
            .await;

        let id = manager.load(&dir, Map::new()).await.unwrap();
        manager.start(&id, None).await.unwrap();
        manager.stop(&id).await.unwrap();
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(manager.state(&id).await, Some(PluginState::Stopped));
    }
}
