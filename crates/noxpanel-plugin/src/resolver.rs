//! Dependency resolution against the host environment.
//!
//! Each declared dependency is checked according to its kind; the report
//! partitions them into satisfied, missing-required and missing-optional.
//! A missing required dependency fails the resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{DependencyKind, PluginDependency, PluginMetadata};

// ─── Host environment ───────────────────────────────────────────────

/// What the running host provides to plugins.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    pub framework_version: semver::Version,
    pub features: HashSet<String>,
    /// Language packages available to plugins, name to version.
    pub packages: HashMap<String, String>,
    /// Known service addresses, name to `host:port`.
    pub services: HashMap<String, String>,
    pub probe_timeout: Duration,
}

const DEFAULT_FEATURES: &str = "sandbox,marketplace,events";

fn crate_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or(semver::Version::new(0, 1, 0))
}

fn parse_features(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self {
            framework_version: crate_version(),
            features: parse_features(DEFAULT_FEATURES),
            packages: HashMap::new(),
            services: HashMap::new(),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

impl HostEnvironment {
    /// Build the environment from `PLUGIN_FRAMEWORK_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            framework_version: std::env::var("PLUGIN_FRAMEWORK_VERSION")
                .ok()
                .and_then(|v| semver::Version::parse(&v).ok())
                .unwrap_or(defaults.framework_version),
            features: std::env::var("PLUGIN_FRAMEWORK_FEATURES")
                .map(|v| parse_features(&v))
                .unwrap_or(defaults.features),
            probe_timeout: std::env::var("PLUGIN_SERVICE_PROBE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            ..defaults
        }
    }

    pub fn with_package(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.packages.insert(name.into(), version.into());
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.services.insert(name.into(), address.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }
}

// ─── Service probes ─────────────────────────────────────────────────

/// Reachability check for service dependencies.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn is_available(&self, service: &str) -> bool;
}

/// Probe that opens a TCP connection to the service address.
#[derive(Debug, Clone)]
pub struct TcpServiceProbe {
    addresses: HashMap<String, String>,
    timeout: Duration,
}

impl TcpServiceProbe {
    pub fn new(addresses: HashMap<String, String>, timeout: Duration) -> Self {
        Self { addresses, timeout }
    }

    pub fn from_environment(env: &HostEnvironment) -> Self {
        Self::new(env.services.clone(), env.probe_timeout)
    }

    fn address_of(&self, service: &str) -> Option<String> {
        if let Some(addr) = self.addresses.get(service) {
            return Some(addr.clone());
        }
        let (host, port) = service.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(service.to_string())
    }
}

#[async_trait]
impl ServiceProbe for TcpServiceProbe {
    async fn is_available(&self, service: &str) -> bool {
        let Some(addr) = self.address_of(service) else {
            tracing::debug!(service = %service, "no address known for service");
            return false;
        };
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(service = %service, address = %addr, error = %e, "service unreachable");
                false
            }
            Err(_) => {
                tracing::debug!(service = %service, address = %addr, "service probe timed out");
                false
            }
        }
    }
}

// ─── Report ─────────────────────────────────────────────────────────

/// Outcome of checking one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyCheck {
    pub dependency: PluginDependency,
    pub available: bool,
    pub found_version: Option<String>,
    pub reason: Option<String>,
}

impl DependencyCheck {
    fn satisfied(dependency: &PluginDependency, found_version: Option<String>) -> Self {
        Self {
            dependency: dependency.clone(),
            available: true,
            found_version,
            reason: None,
        }
    }

    fn missing(
        dependency: &PluginDependency,
        found_version: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            dependency: dependency.clone(),
            available: false,
            found_version,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionReport {
    pub plugin_id: String,
    pub satisfied: Vec<DependencyCheck>,
    pub missing_required: Vec<DependencyCheck>,
    pub missing_optional: Vec<DependencyCheck>,
    /// Plugin ids in the order they must be installed, root last.
    pub install_order: Vec<String>,
}

impl ResolutionReport {
    pub fn success(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// Names of every missing dependency, required first.
    pub fn missing(&self) -> Vec<&str> {
        self.missing_required
            .iter()
            .chain(&self.missing_optional)
            .map(|c| c.dependency.name.as_str())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.missing_optional
            .iter()
            .map(|c| {
                format!(
                    "optional dependency '{}' unavailable: {}",
                    c.dependency.name,
                    c.reason.as_deref().unwrap_or("not found")
                )
            })
            .collect()
    }

    /// The first missing required dependency as an error.
    pub fn into_error(self) -> Option<PluginError> {
        let check = self.missing_required.into_iter().next()?;
        Some(PluginError::Dependency {
            plugin: self.plugin_id,
            dependency: check.dependency.name,
            reason: check.reason.unwrap_or_else(|| "unavailable".into()),
        })
    }
}

// ─── Resolver ───────────────────────────────────────────────────────

pub struct DependencyResolver {
    env: HostEnvironment,
    probe: Arc<dyn ServiceProbe>,
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(HostEnvironment::default())
    }
}

impl DependencyResolver {
    pub fn new(env: HostEnvironment) -> Self {
        let probe = Arc::new(TcpServiceProbe::from_environment(&env));
        Self { env, probe }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ServiceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn environment(&self) -> &HostEnvironment {
        &self.env
    }

    /// Check that the host framework satisfies the plugin's requirement.
    pub fn check_framework(&self, metadata: &PluginMetadata) -> PluginResult<()> {
        let req = semver::VersionReq::parse(&metadata.framework_version)?;
        if req.matches(&self.env.framework_version) {
            return Ok(());
        }
        Err(PluginError::Dependency {
            plugin: metadata.id.clone(),
            dependency: "framework".into(),
            reason: format!(
                "requires {} but host is {}",
                metadata.framework_version, self.env.framework_version
            ),
        })
    }

    /// Check one dependency. `loaded` maps loaded plugin ids to versions.
    pub async fn check(
        &self,
        dependency: &PluginDependency,
        loaded: &HashMap<String, String>,
    ) -> DependencyCheck {
        let req = match dependency.version_req() {
            Ok(req) => req,
            Err(e) => {
                return DependencyCheck::missing(
                    dependency,
                    None,
                    format!("invalid version requirement: {e}"),
                )
            }
        };

        match dependency.kind {
            DependencyKind::Plugin => match loaded.get(&dependency.name) {
                Some(version) => versioned(dependency, req.as_ref(), version),
                None => DependencyCheck::missing(dependency, None, "plugin is not loaded"),
            },
            DependencyKind::LanguagePackage => match self.env.packages.get(&dependency.name) {
                Some(version) => versioned(dependency, req.as_ref(), version),
                None => DependencyCheck::missing(dependency, None, "package is not installed"),
            },
            DependencyKind::SystemBinary => match which::which(&dependency.name) {
                Ok(path) => DependencyCheck::satisfied(dependency, None).with_note(path.display()),
                Err(_) => DependencyCheck::missing(dependency, None, "binary not found on PATH"),
            },
            DependencyKind::Service => {
                if self.probe.is_available(&dependency.name).await {
                    DependencyCheck::satisfied(dependency, None)
                } else {
                    DependencyCheck::missing(dependency, None, "service is unreachable")
                }
            }
            DependencyKind::FrameworkFeature => {
                if self.env.features.contains(&dependency.name) {
                    let version = self.env.framework_version.to_string();
                    versioned(dependency, req.as_ref(), &version)
                } else {
                    DependencyCheck::missing(dependency, None, "feature is not supported")
                }
            }
        }
    }

    /// Check every declared dependency of `metadata`.
    pub async fn resolve(
        &self,
        metadata: &PluginMetadata,
        loaded: &HashMap<String, String>,
    ) -> ResolutionReport {
        let mut report = ResolutionReport {
            plugin_id: metadata.id.clone(),
            ..Default::default()
        };

        for dependency in &metadata.dependencies {
            let check = self.check(dependency, loaded).await;
            if check.available {
                report.satisfied.push(check);
            } else if dependency.optional {
                tracing::warn!(
                    plugin = %metadata.id,
                    dependency = %dependency.name,
                    reason = ?check.reason,
                    "optional dependency unavailable"
                );
                report.missing_optional.push(check);
            } else {
                report.missing_required.push(check);
            }
        }

        report
    }
}

impl DependencyCheck {
    fn with_note(mut self, location: impl std::fmt::Display) -> Self {
        self.reason = Some(format!("found at {location}"));
        self
    }
}

fn versioned(
    dependency: &PluginDependency,
    req: Option<&semver::VersionReq>,
    found: &str,
) -> DependencyCheck {
    let Some(req) = req else {
        return DependencyCheck::satisfied(dependency, Some(found.to_string()));
    };
    match semver::Version::parse(found) {
        Ok(version) if req.matches(&version) => {
            DependencyCheck::satisfied(dependency, Some(found.to_string()))
        }
        Ok(_) => DependencyCheck::missing(
            dependency,
            Some(found.to_string()),
            format!("version {found} does not satisfy {req}"),
        ),
        Err(_) => DependencyCheck::missing(
            dependency,
            Some(found.to_string()),
            format!("available version '{found}' is not valid semver"),
        ),
    }
}

// ─── Ordering ───────────────────────────────────────────────────────

/// Order `roots` and everything they transitively depend on so that every
/// dependency precedes its dependents.
///
/// `edges` maps a node to the nodes it depends on; nodes without an entry
/// are leaves. A cycle fails with [`PluginError::DependencyCycle`] carrying
/// the cycle path, first node repeated at the end.
pub fn topological_order<'a, I>(roots: I, edges: &HashMap<String, Vec<String>>) -> PluginResult<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    fn visit<'e>(
        node: &'e str,
        edges: &'e HashMap<String, Vec<String>>,
        visiting: &mut HashSet<&'e str>,
        visited: &mut HashSet<&'e str>,
        path: &mut Vec<&'e str>,
        order: &mut Vec<String>,
    ) -> PluginResult<()> {
        visiting.insert(node);
        path.push(node);

        if let Some(deps) = edges.get(node) {
            for dep in deps {
                let dep = dep.as_str();
                if visiting.contains(dep) {
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Err(PluginError::DependencyCycle(cycle));
                }
                if !visited.contains(dep) {
                    visit(dep, edges, visiting, visited, path, order)?;
                }
            }
        }

        path.pop();
        visiting.remove(node);
        visited.insert(node);
        order.push(node.to_string());
        Ok(())
    }

    let owned_roots: Vec<String> = roots.into_iter().map(str::to_string).collect();

    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    let mut path = Vec::new();
    let mut order = Vec::new();

    for root in &owned_roots {
        if visited.contains(root.as_str()) {
            continue;
        }
        visit(root.as_str(), edges, &mut visiting, &mut visited, &mut path, &mut order)?;
    }

    Ok(order)
}

// ─── Tests ──────────────────────────────────────────────────────────
