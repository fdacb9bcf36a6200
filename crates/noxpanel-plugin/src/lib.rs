//! NoxPanel Plugin Runtime
//!
//! Loads third-party plugins from manifest directories, drives them through
//! a checked lifecycle state machine, runs them inside an isolation layer,
//! and keeps a durable marketplace catalog with ratings, security scans and
//! dependency-ordered installs.

pub mod error;
pub mod events;
pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod manifest;
pub mod marketplace;
pub mod registry;
pub mod resolver;
pub mod sandbox;
pub mod scanner;

pub use error::{PluginError, PluginResult};
pub use events::{LifecycleEvent, KNOWN_EVENTS};
pub use instance::{
    ExecutionContext, ExecutionResult, Plugin, PluginFault, PluginInfo, PluginInstance,
};
pub use lifecycle::PluginState;
pub use manager::{ManagerConfig, ManagerStats, PluginCatalog, PluginManager};
pub use manifest::{DependencyKind, PluginDependency, PluginManifest, PluginMetadata, PluginType};
pub use marketplace::{BrowsePage, Marketplace, PluginDetails, SearchPage};
pub use registry::{
    PluginCollection, PluginRating, PluginRegistry, PluginRegistryEntry, PluginStatistics,
    PluginStatus, SearchQuery, SearchResults, SortBy, SortOrder,
};
pub use resolver::{DependencyResolver, HostEnvironment, ResolutionReport, ServiceProbe};
pub use sandbox::{Isolation, ResourceLimits, SandboxConfig, SandboxHandle, TaskIsolation};
pub use scanner::{PackageContents, ScanStatus, SecurityScanResult, SecurityScanner};
