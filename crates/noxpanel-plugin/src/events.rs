//! Lifecycle events published by the plugin manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::PluginState;

/// Event names hosts can observe on the manager's broadcast channel.
pub const KNOWN_EVENTS: &[&str] = &[
    "on_plugin_loaded",
    "on_plugin_started",
    "on_plugin_stopped",
    "on_plugin_disabled",
    "on_plugin_error",
    "on_plugin_unloaded",
    "on_state_changed",
];

/// A lifecycle event for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub name: String,
    pub plugin_id: String,
    pub from: Option<PluginState>,
    pub to: Option<PluginState>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Event for an accepted state transition.
    pub fn transition(plugin_id: impl Into<String>, from: PluginState, to: PluginState) -> Self {
        let name = match to {
            PluginState::Loaded => "on_plugin_loaded",
            PluginState::Active => "on_plugin_started",
            PluginState::Stopped => "on_plugin_stopped",
            PluginState::Disabled => "on_plugin_disabled",
            PluginState::Error => "on_plugin_error",
            _ => "on_state_changed",
        };
        Self {
            name: name.to_string(),
            plugin_id: plugin_id.into(),
            from: Some(from),
            to: Some(to),
            detail: None,
            at: Utc::now(),
        }
    }

    /// Event for a plugin removed from the manager.
    pub fn unloaded(plugin_id: impl Into<String>, last_state: PluginState) -> Self {
        Self {
            name: "on_plugin_unloaded".to_string(),
            plugin_id: plugin_id.into(),
            from: Some(last_state),
            to: None,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Check if this event name is a known lifecycle event.
    pub fn is_known_event(name: &str) -> bool {
        KNOWN_EVENTS.contains(&name)
    }
}
