//! The plugin contract and the runtime wrapper around one loaded plugin.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{PluginError, PluginResult};
use crate::lifecycle::PluginState;
use crate::manifest::PluginMetadata;
use crate::sandbox::SandboxHandle;

/// Version of the plugin contract this runtime speaks.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Permission granting administrator rights to a plugin context.
pub const ADMIN_PERMISSION: &str = "admin";

/// Failure reported by plugin code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct PluginFault {
    pub message: String,
    pub code: Option<String>,
}

impl PluginFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<String> for PluginFault {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginFault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// ─── Execution context ──────────────────────────────────────────────

/// Per-activation context handed to `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plugin_id: String,
    pub sandbox_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: String,
    pub environment: HashMap<String, String>,
    pub configuration: Map<String, Value>,
    pub permissions: Vec<String>,
}

impl ExecutionContext {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has_permission(ADMIN_PERMISSION)
    }
}

// ─── Plugin contract ────────────────────────────────────────────────

/// Contract every plugin implements.
///
/// Hosts register a constructor for each entry point with the manager's
/// catalog; the manager owns the returned value for the plugin's lifetime.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(&mut self, context: &ExecutionContext) -> Result<bool, PluginFault>;

    async fn execute(&mut self, operation: &str, params: Value) -> Result<Value, PluginFault>;

    async fn cleanup(&mut self) -> Result<bool, PluginFault>;

    /// Self-description used when no `plugin.toml` is present.
    fn describe(&self) -> Option<PluginMetadata> {
        None
    }

    /// Problems with the supplied configuration; empty means valid.
    fn validate_configuration(&self, _config: &Map<String, Value>) -> Vec<String> {
        Vec::new()
    }

    fn supported_operations(&self) -> Vec<String> {
        Vec::new()
    }

    fn status(&self) -> Value {
        Value::Null
    }

    /// Turn a fault raised by `execute` into the error payload returned to
    /// the caller.
    fn handle_error(&self, operation: &str, fault: &PluginFault) -> Value {
        json!({
            "operation": operation,
            "message": fault.message,
            "code": fault.code,
        })
    }

    fn api_version(&self) -> u32 {
        PLUGIN_API_VERSION
    }
}

// ─── Result envelope ────────────────────────────────────────────────

/// Structured outcome of `PluginManager::execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub plugin_id: String,
    pub operation: String,
    pub data: Value,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Wrap a plugin's return value. Objects are kept as-is; any other
    /// value lands under `result`.
    pub fn ok(plugin_id: &str, operation: &str, value: Value, elapsed_ms: u64) -> Self {
        let data = match value {
            Value::Object(_) => value,
            other => json!({ "result": other }),
        };
        Self {
            success: true,
            plugin_id: plugin_id.to_string(),
            operation: operation.to_string(),
            data,
            error: None,
            error_kind: None,
            execution_time_ms: elapsed_ms,
        }
    }

    pub fn failed(
        plugin_id: &str,
        operation: &str,
        error: &PluginError,
        data: Value,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            success: false,
            plugin_id: plugin_id.to_string(),
            operation: operation.to_string(),
            data,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            execution_time_ms: elapsed_ms,
        }
    }
}

// ─── Instance ───────────────────────────────────────────────────────

/// Snapshot of a loaded plugin for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub execution_count: u64,
    pub error_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sandbox_id: Option<String>,
    pub source: Option<PathBuf>,
    pub warnings: Vec<String>,
    pub status: Value,
}

/// Runtime wrapper around one plugin.
pub struct PluginInstance {
    metadata: PluginMetadata,
    state: PluginState,
    pub(crate) plugin: Box<dyn Plugin>,
    pub(crate) context: Option<ExecutionContext>,
    pub(crate) sandbox: Option<Box<dyn SandboxHandle>>,
    configuration: Map<String, Value>,
    execution_count: u64,
    error_count: u64,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    source: Option<PathBuf>,
    warnings: Vec<String>,
    detached: bool,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.metadata.id)
            .field("state", &self.state)
            .field("execution_count", &self.execution_count)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}

impl PluginInstance {
    pub fn new(
        metadata: PluginMetadata,
        plugin: Box<dyn Plugin>,
        configuration: Map<String, Value>,
    ) -> Self {
        Self {
            metadata,
            state: PluginState::Unloaded,
            plugin,
            context: None,
            sandbox: None,
            configuration,
            execution_count: 0,
            error_count: 0,
            started_at: None,
            last_error: None,
            source: None,
            warnings: Vec::new(),
            detached: false,
        }
    }

    pub fn with_source(mut self, source: PathBuf) -> Self {
        self.source = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    pub fn context(&self) -> Option<&ExecutionContext> {
        self.context.as_ref()
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Move to `to` if the lifecycle table allows it; otherwise leave the
    /// state unchanged. Returns the previous state.
    pub fn transition(&mut self, to: PluginState) -> PluginResult<PluginState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            tracing::warn!(
                plugin = %self.metadata.id,
                from = %from,
                to = %to,
                "rejected illegal state transition"
            );
            return Err(PluginError::InvalidTransition {
                plugin: self.metadata.id.clone(),
                from,
                to,
            });
        }
        self.state = to;
        tracing::info!(plugin = %self.metadata.id, from = %from, to = %to, "state transition");
        Ok(from)
    }

    /// Record a failure and move to `Error` when the table allows it.
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<PluginState> {
        let reason = reason.into();
        tracing::error!(plugin = %self.metadata.id, state = %self.state, error = %reason, "plugin failed");
        self.last_error = Some(reason);
        self.transition(PluginState::Error).ok()
    }

    pub(crate) fn mark_started(&mut self, context: ExecutionContext) {
        self.context = Some(context);
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn clear_activation(&mut self) {
        self.context = None;
        self.started_at = None;
    }

    /// Mark the instance as removed from its manager. Callers that were
    /// already waiting on its lock must treat it as not loaded.
    pub(crate) fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn record_execution(&mut self, success: bool) {
        self.execution_count += 1;
        if !success {
            self.error_count += 1;
        }
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            metadata: self.metadata.clone(),
            state: self.state,
            execution_count: self.execution_count,
            error_count: self.error_count,
            started_at: self.started_at,
            last_error: self.last_error.clone(),
            sandbox_id: self.sandbox.as_ref().map(|s| s.id().to_string()),
            source: self.source.clone(),
            warnings: self.warnings.clone(),
            status: self.plugin.status(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
