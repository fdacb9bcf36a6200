//! Plugin runtime error types.

use thiserror::Error;

use crate::lifecycle::PluginState;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("unmet dependency '{dependency}' for plugin {plugin}: {reason}")]
    Dependency {
        plugin: String,
        dependency: String,
        reason: String,
    },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("import error: {0}")]
    Import(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error("invalid configuration for plugin {plugin}: {}", .problems.join("; "))]
    InvalidConfiguration {
        plugin: String,
        problems: Vec<String>,
    },

    #[error("privilege error: plugin {0} requires administrator rights")]
    Privilege(String),

    #[error("initialization failed for plugin {plugin}: {reason}")]
    Initialization { plugin: String, reason: String },

    #[error("plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("plugin {plugin} is not active (state: {state})")]
    NotActive { plugin: String, state: PluginState },

    #[error("invalid transition for plugin {plugin}: {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("execution error in plugin {plugin}: {reason}")]
    Execution { plugin: String, reason: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("sandbox timeout: plugin {0} exceeded its execution time limit")]
    SandboxTimeout(String),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("invalid rating {0}: must be between 1 and 5")]
    InvalidRating(i32),

    #[error("invalid registry entry: {0}")]
    InvalidEntry(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    /// Stable machine-readable kind, used in result envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery(_) | Self::InvalidManifest(_) => "discovery",
            Self::Dependency { .. } | Self::DependencyCycle(_) => "dependency",
            Self::Import(_) => "import",
            Self::Interface(_) | Self::InvalidConfiguration { .. } => "interface",
            Self::Privilege(_) => "privilege",
            Self::Initialization { .. } => "initialization",
            Self::NotLoaded(_) => "not_loaded",
            Self::NotActive { .. } => "not_active",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Execution { .. } | Self::Sandbox(_) | Self::SandboxTimeout(_) => "execution",
            Self::Scan(_) => "scan",
            Self::NotFound(_) => "not_found",
            Self::InvalidRating(_) | Self::InvalidEntry(_) => "validation",
            Self::Database(_) | Self::Io(_) | Self::Serialization(_) => "storage",
            Self::TomlParse(_) => "discovery",
            Self::Semver(_) => "validation",
        }
    }
}
