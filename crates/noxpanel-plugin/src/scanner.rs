//! Static security scanning of plugin packages.
//!
//! A scan starts from a score of 100 and subtracts a fixed weight per
//! finding. Findings come from the entry's declared capabilities, the WASM
//! import table, source text patterns and the package hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PluginError, PluginResult};
use crate::registry::PluginRegistryEntry;

/// WASM magic bytes: `\0asm`.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Import namespaces a plugin module may link against.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",
    "noxpanel:host",
    "wasi_snapshot_preview1",
    "wasi_unstable",
];

/// Declared capabilities that grant more than a plugin normally needs.
const DANGEROUS_CAPABILITIES: &[&str] = &[
    "exec",
    "shell",
    "raw_socket",
    "kernel_module",
    "ptrace",
    "setuid",
    "packet_capture",
];

const NETWORK_IMPORTS: &[&str] = &["sock_", "http_", "connect", "fetch", "dns_"];
const FILESYSTEM_IMPORTS: &[&str] = &["path_", "fd_readdir", "read_file", "write_file"];

const DANGEROUS_PATTERNS: &[&str] = &[
    "eval(",
    "exec(",
    "os.system(",
    "subprocess.",
    "__import__(",
    "pickle.loads(",
    "std::process::Command",
    "ctypes.",
];
const NETWORK_PATTERNS: &[&str] = &[
    "socket.",
    "requests.",
    "urllib.",
    "http.client",
    "TcpStream",
    "UdpSocket",
    "reqwest::",
];
const FILESYSTEM_PATTERNS: &[&str] = &[
    "open(",
    "shutil.",
    "os.remove(",
    "os.unlink(",
    "std::fs::",
    "File::create(",
];
const QUALITY_PATTERNS: &[&str] = &["except:", "dbg!(", "console.log(", "print("];

// ─── Result types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    NotScanned,
    Scanning,
    Passed,
    Warning,
    Failed,
    Error,
}

impl ScanStatus {
    /// Status implied by a final score.
    pub fn for_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => ScanStatus::Passed,
            60..=79 => ScanStatus::Warning,
            _ => ScanStatus::Failed,
        }
    }

    /// Whether a plugin with this scan outcome may be published.
    pub fn allows_publish(self) -> bool {
        matches!(self, ScanStatus::Passed | ScanStatus::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    DangerousCapability,
    UndeclaredNetwork,
    UndeclaredFilesystem,
    CodeQuality,
}

impl IssueCategory {
    /// Points subtracted from the score per finding.
    pub fn weight(self) -> u32 {
        match self {
            IssueCategory::DangerousCapability => 25,
            IssueCategory::UndeclaredNetwork | IssueCategory::UndeclaredFilesystem => 20,
            IssueCategory::CodeQuality => 5,
        }
    }

    fn recommendation(self) -> &'static str {
        match self {
            IssueCategory::DangerousCapability => {
                "Remove dynamic code execution and privileged capabilities, or justify them for review"
            }
            IssueCategory::UndeclaredNetwork => {
                "Declare requires_network in plugin.toml or remove network access"
            }
            IssueCategory::UndeclaredFilesystem => {
                "Declare requires_filesystem in plugin.toml or remove filesystem access"
            }
            IssueCategory::CodeQuality => {
                "Address code quality findings and fill in missing package metadata"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub category: IssueCategory,
    pub severity: Severity,
    pub description: String,
    pub location: Option<String>,
}

impl SecurityIssue {
    fn new(category: IssueCategory, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            description: description.into(),
            location: None,
        }
    }

    fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityScanResult {
    pub scan_id: String,
    pub status: ScanStatus,
    pub score: u8,
    pub issues: Vec<SecurityIssue>,
    pub recommendations: Vec<String>,
    pub scanned_at: chrono::DateTime<chrono::Utc>,
}

impl SecurityScanResult {
    /// Build a completed result from its findings.
    pub fn from_issues(issues: Vec<SecurityIssue>) -> Self {
        let score = score_for(&issues);
        let mut categories: Vec<IssueCategory> = issues.iter().map(|i| i.category).collect();
        categories.sort();
        categories.dedup();
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            status: ScanStatus::for_score(score),
            score,
            issues,
            recommendations: categories
                .into_iter()
                .map(|c| c.recommendation().to_string())
                .collect(),
            scanned_at: chrono::Utc::now(),
        }
    }

    /// Result for a scan that could not complete.
    pub fn errored(error: &PluginError) -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            status: ScanStatus::Error,
            score: 0,
            issues: Vec::new(),
            recommendations: vec![format!("Scan could not complete ({error}); fix the package and rescan")],
            scanned_at: chrono::Utc::now(),
        }
    }
}

/// Score for a set of findings, clamped to 0..=100.
pub fn score_for(issues: &[SecurityIssue]) -> u8 {
    let penalty: u32 = issues.iter().map(|i| i.category.weight()).sum();
    100u32.saturating_sub(penalty) as u8
}

// ─── Scanner ────────────────────────────────────────────────────────

/// Package payload available to the scanner besides the registry entry.
#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    /// Compiled WASM module, if the plugin ships one.
    pub wasm: Option<Vec<u8>>,
    /// Source files as (path, text).
    pub sources: Vec<(String, String)>,
    /// Raw package archive, checked against the entry's `package_hash`.
    pub archive: Option<Vec<u8>>,
}

/// Hex SHA-256 of a package archive.
pub fn package_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Default, Clone)]
pub struct SecurityScanner;

impl SecurityScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scan an entry and its optional package contents.
    ///
    /// Never fails: internal errors yield a result with status `Error` and
    /// score 0.
    pub fn scan(
        &self,
        entry: &PluginRegistryEntry,
        contents: Option<&PackageContents>,
    ) -> SecurityScanResult {
        match self.collect_issues(entry, contents) {
            Ok(issues) => {
                let result = SecurityScanResult::from_issues(issues);
                tracing::info!(
                    plugin = %entry.metadata.id,
                    score = result.score,
                    status = ?result.status,
                    issues = result.issues.len(),
                    "security scan completed"
                );
                result
            }
            Err(e) => {
                tracing::error!(plugin = %entry.metadata.id, "security scan failed: {e}");
                SecurityScanResult::errored(&e)
            }
        }
    }

    fn collect_issues(
        &self,
        entry: &PluginRegistryEntry,
        contents: Option<&PackageContents>,
    ) -> PluginResult<Vec<SecurityIssue>> {
        let mut issues = self.metadata_issues(entry);

        if let Some(contents) = contents {
            if let Some(ref wasm) = contents.wasm {
                issues.extend(self.wasm_issues(entry, wasm)?);
            }
            for (path, text) in &contents.sources {
                issues.extend(self.source_issues(entry, path, text));
            }
            if let (Some(archive), Some(expected)) = (&contents.archive, &entry.package_hash) {
                let actual = package_hash(archive);
                if !actual.eq_ignore_ascii_case(expected) {
                    issues.push(SecurityIssue::new(
                        IssueCategory::DangerousCapability,
                        Severity::Critical,
                        format!("package hash mismatch: expected {expected}, got {actual}"),
                    ));
                }
            }
        }

        Ok(issues)
    }

    fn metadata_issues(&self, entry: &PluginRegistryEntry) -> Vec<SecurityIssue> {
        let meta = &entry.metadata;
        let mut issues = Vec::new();

        for capability in &meta.capabilities {
            if DANGEROUS_CAPABILITIES.contains(&capability.as_str()) {
                issues.push(SecurityIssue::new(
                    IssueCategory::DangerousCapability,
                    Severity::High,
                    format!("declares dangerous capability '{capability}'"),
                ));
            }
        }

        if meta.requires_admin && !meta.trusted {
            issues.push(SecurityIssue::new(
                IssueCategory::DangerousCapability,
                Severity::High,
                "requires administrator rights but is not marked trusted",
            ));
        }

        if meta.description.trim().is_empty() {
            issues.push(SecurityIssue::new(
                IssueCategory::CodeQuality,
                Severity::Low,
                "missing description",
            ));
        }

        if !meta.trusted && meta.checksum.is_none() && meta.signature.is_none() {
            issues.push(SecurityIssue::new(
                IssueCategory::CodeQuality,
                Severity::Medium,
                "package is neither checksummed nor signed",
            ));
        }

        issues
    }

    fn wasm_issues(&self, entry: &PluginRegistryEntry, wasm: &[u8]) -> PluginResult<Vec<SecurityIssue>> {
        use wasmparser::{Parser, Payload};

        if wasm.len() < 4 || &wasm[..4] != WASM_MAGIC {
            return Err(PluginError::Scan(
                "invalid WASM binary: magic bytes mismatch".into(),
            ));
        }

        let meta = &entry.metadata;
        let mut issues = Vec::new();

        for payload in Parser::new(0).parse_all(wasm) {
            let payload =
                payload.map_err(|e| PluginError::Scan(format!("failed to parse WASM: {e}")))?;

            let Payload::ImportSection(reader) = payload else {
                continue;
            };
            for import in reader {
                let import =
                    import.map_err(|e| PluginError::Scan(format!("failed to read import: {e}")))?;
                let location = format!("{}::{}", import.module, import.name);

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    issues.push(
                        SecurityIssue::new(
                            IssueCategory::DangerousCapability,
                            Severity::High,
                            format!("imports from unauthorized namespace '{}'", import.module),
                        )
                        .at(location.clone()),
                    );
                }
                if !meta.requires_network && matches_any(import.name, NETWORK_IMPORTS) {
                    issues.push(
                        SecurityIssue::new(
                            IssueCategory::UndeclaredNetwork,
                            Severity::High,
                            format!("imports network function '{}'", import.name),
                        )
                        .at(location.clone()),
                    );
                }
                if !meta.requires_filesystem && matches_any(import.name, FILESYSTEM_IMPORTS) {
                    issues.push(
                        SecurityIssue::new(
                            IssueCategory::UndeclaredFilesystem,
                            Severity::High,
                            format!("imports filesystem function '{}'", import.name),
                        )
                        .at(location),
                    );
                }
            }
        }

        Ok(issues)
    }

    /// One finding per (category, pattern) per file, at its first line.
    fn source_issues(&self, entry: &PluginRegistryEntry, path: &str, text: &str) -> Vec<SecurityIssue> {
        let meta = &entry.metadata;
        let mut rules: Vec<(IssueCategory, Severity, &[&str])> = vec![
            (IssueCategory::DangerousCapability, Severity::High, DANGEROUS_PATTERNS),
            (IssueCategory::CodeQuality, Severity::Low, QUALITY_PATTERNS),
        ];
        if !meta.requires_network {
            rules.push((IssueCategory::UndeclaredNetwork, Severity::Medium, NETWORK_PATTERNS));
        }
        if !meta.requires_filesystem {
            rules.push((IssueCategory::UndeclaredFilesystem, Severity::Medium, FILESYSTEM_PATTERNS));
        }

        let mut issues = Vec::new();
        for (category, severity, patterns) in rules {
            for pattern in patterns {
                let hit = text
                    .lines()
                    .enumerate()
                    .find(|(_, line)| line.contains(pattern));
                if let Some((line_no, _)) = hit {
                    issues.push(
                        SecurityIssue::new(category, severity, format!("uses '{pattern}'"))
                            .at(format!("{path}:{}", line_no + 1)),
                    );
                }
            }
        }
        issues
    }
}

fn matches_any(name: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| name.starts_with(n) || name == n.trim_end_matches('_'))
}

// ─── Tests ──────────────────────────────────────────────────────────
