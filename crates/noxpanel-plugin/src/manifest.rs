//! Plugin metadata and manifest parsing.
//!
//! Every plugin directory may carry a `plugin.toml` declaring identity,
//! dependencies, resource estimates and permissions. When it is absent the
//! manager infers metadata from the plugin itself.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// File name of the manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Version requirement meaning "any version".
pub const ANY_VERSION: &str = "any";

// ─── Classification ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    System,
    Network,
    Security,
    Analysis,
    Integration,
    Utility,
    #[default]
    Extension,
}

impl PluginType {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginType::System => "system",
            PluginType::Network => "network",
            PluginType::Security => "security",
            PluginType::Analysis => "analysis",
            PluginType::Integration => "integration",
            PluginType::Utility => "utility",
            PluginType::Extension => "extension",
        }
    }
}

impl FromStr for PluginType {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(PluginType::System),
            "network" => Ok(PluginType::Network),
            "security" => Ok(PluginType::Security),
            "analysis" => Ok(PluginType::Analysis),
            "integration" => Ok(PluginType::Integration),
            "utility" => Ok(PluginType::Utility),
            "extension" => Ok(PluginType::Extension),
            other => Err(PluginError::InvalidManifest(format!(
                "unknown plugin type '{other}'"
            ))),
        }
    }
}

/// What a dependency refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Plugin,
    LanguagePackage,
    SystemBinary,
    Service,
    FrameworkFeature,
}

fn default_version_requirement() -> String {
    ANY_VERSION.to_string()
}

/// A single declared prerequisite of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: DependencyKind,
    #[serde(default = "default_version_requirement")]
    pub version_requirement: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
}

impl PluginDependency {
    pub fn new(name: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            version_requirement: default_version_requirement(),
            optional: false,
            description: String::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.version_requirement = requirement.into();
        self
    }

    /// Parsed version requirement; `None` means any version satisfies it.
    pub fn version_req(&self) -> Result<Option<semver::VersionReq>, PluginError> {
        let raw = self.version_requirement.trim();
        if raw.is_empty() || raw == "*" || raw.eq_ignore_ascii_case(ANY_VERSION) {
            return Ok(None);
        }
        Ok(Some(semver::VersionReq::parse(raw)?))
    }
}

// ─── Metadata ───────────────────────────────────────────────────────

fn default_framework_requirement() -> String {
    "*".to_string()
}

fn default_memory_mb() -> u64 {
    64
}

fn default_cpu_percent() -> f32 {
    10.0
}

/// Identity and declared contract of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    #[serde(default = "default_framework_requirement")]
    pub framework_version: String,
    #[serde(default)]
    pub sandbox_required: bool,
    #[serde(default)]
    pub requires_admin: bool,
    #[serde(default = "default_memory_mb")]
    pub estimated_memory_mb: u64,
    #[serde(default = "default_cpu_percent")]
    pub estimated_cpu_percent: f32,
    #[serde(default)]
    pub requires_network: bool,
    #[serde(default)]
    pub requires_filesystem: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub trusted: bool,
}

impl PluginMetadata {
    /// Minimal metadata for a plugin whose manifest could not be found.
    pub fn inferred(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "0.1.0".to_string(),
            description: String::new(),
            author: String::new(),
            plugin_type: PluginType::Extension,
            dependencies: Vec::new(),
            framework_version: default_framework_requirement(),
            sandbox_required: false,
            requires_admin: false,
            estimated_memory_mb: default_memory_mb(),
            estimated_cpu_percent: default_cpu_percent(),
            requires_network: false,
            requires_filesystem: false,
            capabilities: Vec::new(),
            checksum: None,
            signature: None,
            trusted: false,
        }
    }

    pub fn parsed_version(&self) -> Result<semver::Version, PluginError> {
        Ok(semver::Version::parse(&self.version)?)
    }

    /// Required plugin-type dependencies, in declaration order.
    pub fn plugin_dependencies(&self) -> impl Iterator<Item = &PluginDependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Plugin && !d.optional)
    }

    /// Validate identity, version and dependency declarations.
    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_id(&self.id)?;

        if self.name.trim().is_empty() || self.name.len() > 255 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.name must be 1-255 characters, got {}",
                self.name.len()
            )));
        }

        validate_semver(&self.version, "plugin.version")?;

        if self.description.len() > 500 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.description must be at most 500 characters, got {}",
                self.description.len()
            )));
        }

        semver::VersionReq::parse(&self.framework_version).map_err(|_| {
            PluginError::InvalidManifest(format!(
                "plugin.framework_version is not a valid requirement: '{}'",
                self.framework_version
            ))
        })?;

        if let Some(ref checksum) = self.checksum {
            if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(PluginError::InvalidManifest(
                    "plugin.checksum must be a 64-character SHA-256 hex digest".into(),
                ));
            }
        }

        if !(0.0..=100.0).contains(&self.estimated_cpu_percent) {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.estimated_cpu_percent must be within 0-100, got {}",
                self.estimated_cpu_percent
            )));
        }

        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return Err(PluginError::InvalidManifest(
                    "dependency name must not be empty".into(),
                ));
            }
            if dep.kind == DependencyKind::Plugin && dep.name == self.id {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin '{}' cannot depend on itself",
                    self.id
                )));
            }
            dep.version_req().map_err(|_| {
                PluginError::InvalidManifest(format!(
                    "dependency '{}' has an invalid version requirement: '{}'",
                    dep.name, dep.version_requirement
                ))
            })?;
        }

        Ok(())
    }
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin id against `^[a-z][a-z0-9_.-]{1,63}$`.
pub fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && !matches!(ch, '-' | '_' | '.') {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

/// Validate a version string as semver.
pub fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

// ─── Manifest document ──────────────────────────────────────────────

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Entry point name the host registered a constructor under.
    #[serde(default)]
    pub entry: Option<String>,
    pub plugin: PluginMetadata,
    /// Default configuration merged under the caller-supplied one.
    #[serde(default)]
    pub defaults: serde_json::Map<String, serde_json::Value>,
}

impl PluginManifest {
    /// Parse a plugin manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        self.plugin.validate()?;
        if let Some(ref entry) = self.entry {
            if entry.trim().is_empty() {
                return Err(PluginError::InvalidManifest(
                    "entry must not be empty when present".into(),
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a plugin manifest from a TOML string.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `plugin.toml` from a plugin directory.
    ///
    /// Returns `Ok(None)` when the file does not exist; any other problem is
    /// a discovery error.
    pub async fn read_from_dir(dir: &Path) -> Result<Option<Self>, PluginError> {
        let path = dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PluginError::Discovery(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Self::parse_and_validate(&content)
            .map(Some)
            .map_err(|e| PluginError::Discovery(format!("{}: {e}", path.display())))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_VALID_TOML: &str = r#"
entry = "dns_watch"

[plugin]
id = "dns-watch"
name = "DNS Watch"
version = "1.2.3"
description = "Watches DNS answers on the home network"
author = "Nox Team"
plugin_type = "network"
framework_version = ">=0.1.0"
sandbox_required = true
estimated_memory_mb = 96
estimated_cpu_percent = 20.0
requires_network = true
capabilities = ["dns"]
checksum = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
trusted = true

[[plugin.dependencies]]
name = "net-core"
type = "plugin"
version_requirement = "^1.0"

[[plugin.dependencies]]
name = "dig"
type = "system_binary"
optional = true
description = "used for manual lookups"

[defaults]
interval_secs = 30
"#;

    const MINIMAL_VALID_TOML: &str = r#"
[plugin]
id = "ab"
name = "AB"
version = "0.1.0"
"#;

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PluginManifest::parse_and_validate(FULL_VALID_TOML).unwrap();
        assert_eq!(manifest.entry.as_deref(), Some("dns_watch"));
        let meta = &manifest.plugin;
        assert_eq!(meta.id, "dns-watch");
        assert_eq!(meta.plugin_type, PluginType::Network);
        assert!(meta.sandbox_required);
        assert_eq!(meta.estimated_memory_mb, 96);
        assert_eq!(meta.dependencies.len(), 2);
        assert_eq!(meta.dependencies[0].kind, DependencyKind::Plugin);
        assert_eq!(meta.dependencies[1].kind, DependencyKind::SystemBinary);
        assert!(meta.dependencies[1].optional);
        assert_eq!(manifest.defaults["interval_secs"], 30);
    }

    #[test]
    fn test_parse_minimal_manifest_uses_defaults() {
        let manifest = PluginManifest::parse_and_validate(MINIMAL_VALID_TOML).unwrap();
        let meta = &manifest.plugin;
        assert!(manifest.entry.is_none());
        assert_eq!(meta.plugin_type, PluginType::Extension);
        assert_eq!(meta.framework_version, "*");
        assert_eq!(meta.estimated_memory_mb, 64);
        assert!(!meta.sandbox_required);
        assert!(meta.dependencies.is_empty());
        assert!(manifest.defaults.is_empty());
    }

    #[test]
    fn test_plugin_dependencies_skip_optional_and_other_kinds() {
        let mut meta = PluginManifest::parse_and_validate(MINIMAL_VALID_TOML)
            .unwrap()
            .plugin;
        meta.dependencies = vec![
            PluginDependency::new("net-core", DependencyKind::Plugin),
            PluginDependency::new("extras", DependencyKind::Plugin).optional(),
            PluginDependency::new("dig", DependencyKind::SystemBinary),
        ];
        let names: Vec<&str> = meta.plugin_dependencies().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["net-core"]);
    }

    #[test]
    fn test_dependency_defaults() {
        let dep: PluginDependency = toml::from_str("name = \"x\"").unwrap();
        assert_eq!(dep.kind, DependencyKind::Plugin);
        assert_eq!(dep.version_requirement, ANY_VERSION);
        assert!(!dep.optional);
        assert!(dep.version_req().unwrap().is_none());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = PluginManifest::parse("this is not valid {{{{ toml").unwrap_err();
        assert!(matches!(err, PluginError::TomlParse(_)));
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn test_validate_invalid_id() {
        for id in ["A", "Upper", "9lives", "has space", ""] {
            let mut meta = PluginMetadata::inferred("ok-id");
            meta.id = id.to_string();
            let err = meta.validate().unwrap_err();
            assert!(matches!(err, PluginError::InvalidManifest(_)), "id {id:?}");
        }
    }

    #[test]
    fn test_validate_invalid_version() {
        let mut meta = PluginMetadata::inferred("my-plugin");
        meta.version = "1.0".into();
        let err = meta.validate().unwrap_err();
        assert!(err.to_string().contains("semver"));
    }

    #[test]
    fn test_validate_prerelease_and_build_versions() {
        let mut meta = PluginMetadata::inferred("my-plugin");
        meta.version = "2.0.0-beta.1+build.7".into();
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_checksum() {
        let mut meta = PluginMetadata::inferred("my-plugin");
        meta.checksum = Some("abc".into());
        assert!(meta.validate().unwrap_err().to_string().contains("SHA-256"));
    }

    #[test]
    fn test_validate_bad_dependency_requirement() {
        let mut meta = PluginMetadata::inferred("my-plugin");
        meta.dependencies
            .push(PluginDependency::new("other", DependencyKind::Plugin).with_requirement(">>1"));
        assert!(meta
            .validate()
            .unwrap_err()
            .to_string()
            .contains("invalid version requirement"));
    }

    #[test]
    fn test_validate_self_dependency() {
        let mut meta = PluginMetadata::inferred("loop");
        meta.dependencies
            .push(PluginDependency::new("loop", DependencyKind::Plugin));
        assert!(meta.validate().unwrap_err().to_string().contains("itself"));
    }

    #[test]
    fn test_validate_bad_framework_requirement() {
        let mut meta = PluginMetadata::inferred("my-plugin");
        meta.framework_version = "not a req".into();
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_inferred_metadata_is_valid() {
        let meta = PluginMetadata::inferred("fritz-watch");
        assert_eq!(meta.name, "fritz-watch");
        assert_eq!(meta.version, "0.1.0");
        meta.validate().unwrap();
    }

    #[test]
    fn test_plugin_type_from_str() {
        assert_eq!("Security".parse::<PluginType>().unwrap(), PluginType::Security);
        assert!("widget".parse::<PluginType>().is_err());
    }

    // ── Reading from disk ───────────────────────────────────────────

    #[tokio::test]
    async fn test_read_from_dir_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = PluginManifest::read_from_dir(dir.path()).await.unwrap();
        assert!(manifest.is_none());
    }

    #[tokio::test]
    async fn test_read_from_dir_unparsable_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "[plugin]\nid = 3").unwrap();
        let err = PluginManifest::read_from_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_read_from_dir_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), FULL_VALID_TOML).unwrap();
        let manifest = PluginManifest::read_from_dir(dir.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest.plugin.id, "dns-watch");
    }
}
