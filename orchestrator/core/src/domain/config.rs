// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) covering:
// - Execution engine worker pool and cancellation settings
// - Process-wide sandbox budgets
// - Admission queue ceilings and backpressure thresholds
// - Pipeline filters
// - Declarative (tool and fixture) module definitions
// - Logging and metrics

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::event::EventType;
use crate::domain::module::{ModuleDescriptor, ModuleKind, OptionSpec, ResourceLimits};

pub const API_VERSION: &str = "argus.dev/v1";
pub const KIND: &str = "OrchestratorConfig";

/// Top-level orchestrator configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "argus.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: OrchestratorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorSpec {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Declarative modules. Native modules are registered in code.
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Per-scan execution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size for one scan
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// How long a cancelled scan waits for running handlers before aborting them
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Timeouts after which a module's remaining work items are suppressed
    #[serde(default = "default_max_timeout_strikes")]
    pub max_timeout_strikes: u32,

    /// Consecutive runtime failures after which a module is skipped (0 = never)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl EngineConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            cancel_grace_secs: default_cancel_grace_secs(),
            max_timeout_strikes: default_max_timeout_strikes(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Process-wide resource sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Handler threads allowed across every running scan
    #[serde(default = "default_global_thread_budget")]
    pub global_thread_budget: usize,

    /// Wall-clock limit for modules that declare none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Cumulative per-scan runtime for modules that declare none (unlimited when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_runtime_budget_secs: Option<u64>,
}

impl SandboxConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn default_runtime_budget(&self) -> Option<Duration> {
        self.default_runtime_budget_secs.map(Duration::from_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            global_thread_budget: default_global_thread_budget(),
            default_timeout_secs: default_timeout_secs(),
            default_runtime_budget_secs: None,
        }
    }
}

/// Scan admission ceilings and backpressure thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_running_scans")]
    pub max_running_scans: usize,

    /// Queue depth at which pressure becomes Elevated
    #[serde(default = "default_elevated_depth")]
    pub elevated_depth: usize,

    /// Queue depth at which pressure becomes Critical (HIGH only)
    #[serde(default = "default_critical_depth")]
    pub critical_depth: usize,

    /// Hard ceiling; beyond it every request is throttled
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_running_scans: default_max_running_scans(),
            elevated_depth: default_elevated_depth(),
            critical_depth: default_critical_depth(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

/// Submission-time event filters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub min_confidence: u8,

    #[serde(default)]
    pub min_visibility: u8,

    #[serde(default = "default_true")]
    pub suppress_false_positives: bool,

    /// Maximum lineage depth; unlimited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0,
            min_visibility: 0,
            suppress_false_positives: true,
            max_depth: None,
        }
    }
}

/// One output of a fixture rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureEmission {
    pub event_type: EventType,
    pub data: String,
}

/// A module declared in the manifest rather than in code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,

    pub kind: ModuleKind,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub watches: BTreeSet<EventType>,

    #[serde(default)]
    pub produces: BTreeSet<EventType>,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub options: Vec<OptionSpec>,

    /// Tool kind: program and arguments. `{data}` and `{type}` are replaced
    /// with the triggering event's data and type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Tool kind: event type for each stdout line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_type: Option<EventType>,

    /// Fixture kind: input data -> emitted events
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixtures: BTreeMap<String, Vec<FixtureEmission>>,
}

impl ModuleDefinition {
    pub fn descriptor(&self) -> ModuleDescriptor {
        let mut produces = self.produces.clone();
        if let Some(output) = &self.output_type {
            produces.insert(output.clone());
        }
        for emission in self.fixtures.values().flatten() {
            produces.insert(emission.event_type.clone());
        }

        ModuleDescriptor {
            name: self.name.clone(),
            summary: self.summary.clone(),
            kind: self.kind,
            watches: self.watches.clone(),
            produces,
            options: self.options.clone(),
            limits: self.limits.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus exporter listen address
    #[serde(default = "default_metrics_listen")]
    pub listen_address: String,
}

fn default_true() -> bool {
    true
}

fn default_max_threads() -> usize {
    3
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_max_timeout_strikes() -> u32 {
    3
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_global_thread_budget() -> usize {
    32
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_running_scans() -> usize {
    4
}

fn default_elevated_depth() -> usize {
    16
}

fn default_critical_depth() -> usize {
    64
}

fn default_max_queue_depth() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9464".to_string()
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "argus".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: OrchestratorSpec::default(),
        }
    }
}

impl OrchestratorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. ARGUS_CONFIG_PATH environment variable
    /// 2. ./argus-config.yaml (working directory)
    /// 3. ~/.argus/config.yaml (user home)
    /// 4. /etc/argus/config.yaml (system, Unix) or C:\ProgramData\Argus\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ARGUS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./argus-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".argus").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/argus/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Argus\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path: fail if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_usize("ARGUS_MAX_THREADS") {
            tracing::info!("Environment override: ARGUS_MAX_THREADS={}", value);
            self.spec.engine.max_threads = value;
        }

        if let Some(value) = env_usize("ARGUS_MAX_RUNNING_SCANS") {
            tracing::info!("Environment override: ARGUS_MAX_RUNNING_SCANS={}", value);
            self.spec.admission.max_running_scans = value;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.engine.max_threads == 0 {
            anyhow::bail!("spec.engine.max_threads must be greater than zero");
        }
        if spec.sandbox.global_thread_budget == 0 {
            anyhow::bail!("spec.sandbox.global_thread_budget must be greater than zero");
        }
        if spec.sandbox.default_timeout_secs == 0 {
            anyhow::bail!("spec.sandbox.default_timeout_secs must be greater than zero");
        }
        if spec.admission.max_running_scans == 0 {
            anyhow::bail!("spec.admission.max_running_scans must be greater than zero");
        }
        if spec.admission.max_queue_depth == 0 {
            anyhow::bail!("spec.admission.max_queue_depth must be greater than zero");
        }

        let admission = &spec.admission;
        if admission.elevated_depth > admission.critical_depth
            || admission.critical_depth > admission.max_queue_depth
        {
            anyhow::bail!(
                "Admission thresholds must satisfy elevated_depth ({}) <= critical_depth ({}) <= max_queue_depth ({})",
                admission.elevated_depth,
                admission.critical_depth,
                admission.max_queue_depth
            );
        }

        if spec.pipeline.min_confidence > 100 || spec.pipeline.min_visibility > 100 {
            anyhow::bail!("spec.pipeline thresholds must be within 0-100");
        }

        let mut seen = HashSet::new();
        for module in &spec.modules {
            if module.name.is_empty() {
                anyhow::bail!("Module name cannot be empty");
            }
            if !seen.insert(module.name.as_str()) {
                anyhow::bail!("Duplicate module definition: {}", module.name);
            }
            if module.limits.max_threads == 0 {
                anyhow::bail!("Module {} declares max_threads = 0", module.name);
            }

            match module.kind {
                ModuleKind::Native => {
                    anyhow::bail!("Module {} is native; native modules are registered in code", module.name);
                }
                ModuleKind::Tool => {
                    if module.command.is_empty() {
                        anyhow::bail!("Tool module {} must declare a command", module.name);
                    }
                    if module.output_type.is_none() {
                        anyhow::bail!("Tool module {} must declare an output_type", module.name);
                    }
                }
                ModuleKind::Fixture => {}
            }
        }

        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid value for {}: '{}'. Expected an integer. Ignoring.", name, raw);
            None
        }
    }
}
