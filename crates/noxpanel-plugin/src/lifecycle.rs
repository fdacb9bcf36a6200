//! Plugin lifecycle state machine.
//!
//! [`PluginState::allowed_targets`] is the only place that decides which
//! transitions are legal. Every state change in the runtime goes through
//! [`PluginState::can_transition_to`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a loaded plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Active,
    Stopping,
    Stopped,
    Error,
    Disabled,
}

impl PluginState {
    pub const ALL: [PluginState; 9] = [
        PluginState::Unloaded,
        PluginState::Loading,
        PluginState::Loaded,
        PluginState::Initializing,
        PluginState::Active,
        PluginState::Stopping,
        PluginState::Stopped,
        PluginState::Error,
        PluginState::Disabled,
    ];

    /// States reachable in one step from `self`.
    pub fn allowed_targets(self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Unloaded => &[Loading, Error],
            Loading => &[Loaded, Error],
            Loaded => &[Initializing, Error, Disabled],
            Initializing => &[Active, Error],
            Active => &[Stopping, Error, Disabled],
            Stopping => &[Stopped, Error],
            Stopped => &[Loading, Disabled],
            Error => &[Loading, Disabled],
            Disabled => &[Loading],
        }
    }

    pub fn can_transition_to(self, target: PluginState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Initializing => "initializing",
            PluginState::Active => "active",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
            PluginState::Disabled => "disabled",
        }
    }

    /// Whether a fresh `Loading -> Loaded` pass is needed before the
    /// instance can be initialized again.
    pub fn needs_reload(self) -> bool {
        matches!(
            self,
            PluginState::Stopped | PluginState::Error | PluginState::Unloaded
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
