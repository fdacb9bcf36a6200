//! Isolation interface consumed by the plugin manager.
//!
//! The manager never runs a sandboxed plugin directly: it asks an
//! [`Isolation`] backend for a [`SandboxHandle`] sized from the plugin's
//! resource estimates and routes every plugin call through
//! [`SandboxHandle::run`]. [`TaskIsolation`] is the in-process backend that
//! enforces the execution time limit on the tokio runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{PluginError, PluginResult};
use crate::instance::PluginFault;
use crate::manifest::PluginMetadata;

// ─── Configuration ──────────────────────────────────────────────────────

/// Defaults applied when a plugin does not estimate its own footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Memory ceiling in megabytes (default: 128).
    pub default_memory_mb: u64,
    /// CPU share in percent (default: 50).
    pub default_cpu_percent: f32,
    /// Wall-clock limit for a single sandboxed call (default: 30 s).
    pub execution_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_memory_mb: 128,
            default_cpu_percent: 50.0,
            execution_timeout_secs: 30,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup; unset or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            default_memory_mb: lookup("PLUGIN_DEFAULT_MEMORY_MB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_memory_mb),
            default_cpu_percent: lookup("PLUGIN_DEFAULT_CPU_PERCENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_cpu_percent),
            execution_timeout_secs: lookup("PLUGIN_EXECUTION_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.execution_timeout_secs),
        }
    }

    /// Resource limits for one plugin, preferring its own estimates.
    pub fn limits_for(&self, metadata: &PluginMetadata) -> ResourceLimits {
        let memory_mb = if metadata.estimated_memory_mb > 0 {
            metadata.estimated_memory_mb
        } else {
            self.default_memory_mb
        };
        let cpu_percent = if metadata.estimated_cpu_percent > 0.0 {
            metadata.estimated_cpu_percent
        } else {
            self.default_cpu_percent
        };
        ResourceLimits {
            memory_mb,
            cpu_percent,
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
        }
    }
}

/// Limits a sandbox must enforce.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_percent: f32,
    pub execution_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        SandboxConfig::default().limits_for(&PluginMetadata::inferred("default"))
    }
}

/// Access a sandbox grants beyond pure computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxPermissions {
    pub network: bool,
    pub filesystem: bool,
}

impl SandboxPermissions {
    pub fn for_plugin(metadata: &PluginMetadata) -> Self {
        Self {
            network: metadata.requires_network,
            filesystem: metadata.requires_filesystem,
        }
    }
}

// ─── Interface ──────────────────────────────────────────────────────────

/// Outcome of a plugin call as seen from inside the sandbox.
pub type TaskOutput = Result<serde_json::Value, PluginFault>;

/// A plugin call handed to a sandbox.
pub type SandboxTask<'a> = Pin<Box<dyn Future<Output = TaskOutput> + Send + 'a>>;

/// Backend able to provision execution sandboxes.
#[async_trait]
pub trait Isolation: Send + Sync {
    async fn create_sandbox(
        &self,
        plugin_id: &str,
        limits: ResourceLimits,
        permissions: SandboxPermissions,
    ) -> PluginResult<Box<dyn SandboxHandle>>;
}

/// A provisioned sandbox.
///
/// `run` returns `Err` only for sandbox-level failures (timeout, torn down);
/// the plugin's own outcome travels inside `Ok`.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn run<'a>(&self, task: SandboxTask<'a>) -> PluginResult<TaskOutput>;

    async fn teardown(&self) -> PluginResult<()>;
}

// ─── In-process backend ─────────────────────────────────────────────────

/// Isolation backend running tasks on the current runtime with a time limit.
#[derive(Debug, Default, Clone)]
pub struct TaskIsolation;

#[async_trait]
impl Isolation for TaskIsolation {
    async fn create_sandbox(
        &self,
        plugin_id: &str,
        limits: ResourceLimits,
        permissions: SandboxPermissions,
    ) -> PluginResult<Box<dyn SandboxHandle>> {
        let id = format!("sbx-{}", uuid::Uuid::new_v4());
        tracing::debug!(
            plugin = %plugin_id,
            sandbox = %id,
            memory_mb = limits.memory_mb,
            cpu_percent = limits.cpu_percent,
            network = permissions.network,
            filesystem = permissions.filesystem,
            "sandbox created"
        );
        Ok(Box::new(TaskSandbox {
            id,
            plugin_id: plugin_id.to_string(),
            limits,
            torn_down: AtomicBool::new(false),
        }))
    }
}

struct TaskSandbox {
    id: String,
    plugin_id: String,
    limits: ResourceLimits,
    torn_down: AtomicBool,
}

#[async_trait]
impl SandboxHandle for TaskSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run<'a>(&self, task: SandboxTask<'a>) -> PluginResult<TaskOutput> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(PluginError::Sandbox(format!(
                "sandbox {} has been torn down",
                self.id
            )));
        }

        match tokio::time::timeout(self.limits.execution_timeout, task).await {
            Ok(output) => Ok(output),
            Err(_) => {
                tracing::warn!(
                    plugin = %self.plugin_id,
                    sandbox = %self.id,
                    timeout_ms = self.limits.execution_timeout.as_millis() as u64,
                    "sandboxed call timed out"
                );
                Err(PluginError::SandboxTimeout(self.plugin_id.clone()))
            }
        }
    }

    async fn teardown(&self) -> PluginResult<()> {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(plugin = %self.plugin_id, sandbox = %self.id, "sandbox torn down");
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
