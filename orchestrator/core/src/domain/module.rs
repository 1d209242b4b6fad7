// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Collection Module Contract
//!
//! The orchestrator never looks inside a module. It only sees five surfaces:
//!
//! | Surface | Purpose |
//! |---------|---------|
//! | [`ReconModule::watches`] | Event types the module consumes (may contain `*`) |
//! | [`ReconModule::produces`] | Event types the module may emit |
//! | [`ReconModule::configure`] | Validate options into an immutable [`ModuleConfig`] |
//! | [`ReconModule::handle`] | Process one event, emitting findings through [`ModuleContext`] |
//! | [`ReconModule::shutdown`] | Idempotent teardown at scan end |
//!
//! Module instances are scan-scoped: the registry builds a fresh instance for
//! every scan, and the same instance may be invoked concurrently for several
//! events. Per-invocation state therefore lives in the [`ModuleContext`], never
//! in mutable fields on the module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::error::ModuleError;
use crate::domain::event::{Event, EventType, SubmitOutcome};
use crate::domain::scan::{ScanId, Target};

/// Closed set of module implementations. Kind-specific behaviour (for example
/// spawning an external tool) stays behind the common trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// In-process Rust handler.
    Native,
    /// External command executed once per event.
    Tool,
    /// Deterministic lookup table, used for tests and dry runs.
    Fixture,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::Native => "native",
            ModuleKind::Tool => "tool",
            ModuleKind::Fixture => "fixture",
        };
        f.write_str(name)
    }
}

/// Declared resource envelope for one invocation of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Threads the invocation occupies. Values above 1 mark a "heavy" module
    /// that runs its own sub-pool; every thread counts against the budgets.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Hard wall-clock limit per invocation. Falls back to the sandbox default.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Cumulative handler time allowed per scan.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub runtime_budget: Option<Duration>,
}

fn default_max_threads() -> usize {
    1
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            timeout: None,
            runtime_budget: None,
        }
    }
}

impl ResourceLimits {
    pub fn is_heavy(&self) -> bool {
        self.max_threads > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    String,
    Integer,
    Boolean,
    List,
}

impl OptionKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            OptionKind::String => value.is_string(),
            OptionKind::Integer => value.is_i64() || value.is_u64(),
            OptionKind::Boolean => value.is_boolean(),
            OptionKind::List => value.is_array(),
        }
    }
}

/// One entry of a module's option schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    pub kind: OptionKind,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Required options without a default (API keys, mostly).
    #[serde(default)]
    pub required: bool,
}

impl OptionSpec {
    pub fn new(name: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Static, process-wide description of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub kind: ModuleKind,
    pub watches: BTreeSet<EventType>,
    pub produces: BTreeSet<EventType>,
    #[serde(default)]
    pub options: Vec<OptionSpec>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            summary: String::new(),
            kind,
            watches: BTreeSet::new(),
            produces: BTreeSet::new(),
            options: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn watching<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.watches.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn watching_all(mut self) -> Self {
        self.watches.insert(EventType::wildcard());
        self
    }

    pub fn producing<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.produces.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_option(mut self, option: OptionSpec) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn watches_all(&self) -> bool {
        self.watches.iter().any(EventType::is_wildcard)
    }
}

/// Raw options as supplied by a caller.
pub type ModuleOptions = BTreeMap<String, Value>;

/// Validated, immutable module configuration. Built once per scan by
/// [`ReconModule::configure`] and shared with every `handle()` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    module: String,
    values: BTreeMap<String, Value>,
}

impl ModuleConfig {
    /// Resolve supplied options against the descriptor's schema: defaults
    /// fill gaps, types are checked, and missing required options fail setup.
    pub fn from_schema(descriptor: &ModuleDescriptor, supplied: &ModuleOptions) -> Result<Self, ModuleError> {
        let mut values = BTreeMap::new();

        for spec in &descriptor.options {
            let value = supplied.get(&spec.name).or(spec.default.as_ref());
            match value {
                Some(value) if value.is_null() && spec.required => {
                    return Err(ModuleError::Setup(format!(
                        "required option '{}' is null",
                        spec.name
                    )));
                }
                Some(value) if !value.is_null() && !spec.kind.accepts(value) => {
                    return Err(ModuleError::Setup(format!(
                        "option '{}' expects {:?}, got {}",
                        spec.name, spec.kind, value
                    )));
                }
                Some(value) => {
                    values.insert(spec.name.clone(), value.clone());
                }
                None if spec.required => {
                    return Err(ModuleError::Setup(format!(
                        "required option '{}' is not set",
                        spec.name
                    )));
                }
                None => {}
            }
        }

        for key in supplied.keys() {
            if !descriptor.options.iter().any(|spec| &spec.name == key) {
                tracing::warn!(module = %descriptor.name, option = %key, "Ignoring undeclared module option");
            }
        }

        Ok(Self {
            module: descriptor.name.clone(),
            values,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.values
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Where a module's findings go. Implemented by the scan's event pipeline.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: Event) -> SubmitOutcome;
}

/// Everything one `handle()` invocation may touch.
#[derive(Clone)]
pub struct ModuleContext {
    scan_id: ScanId,
    module: String,
    target: Arc<Target>,
    config: Arc<ModuleConfig>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("scan_id", &self.scan_id)
            .field("module", &self.module)
            .field("target", &self.target)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ModuleContext {
    pub fn new(
        scan_id: ScanId,
        module: impl Into<String>,
        target: Arc<Target>,
        config: Arc<ModuleConfig>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scan_id,
            module: module.into(),
            target,
            config,
            sink,
            cancel,
        }
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Long-running loops poll this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the scan is cancelled or this invocation timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build a child event attributed to this module.
    pub fn derive(&self, event_type: impl Into<EventType>, data: impl Into<String>, parent: &Event) -> Event {
        Event::derived(event_type, data, self.module.clone(), parent)
    }

    /// Hand a finding to the pipeline.
    pub async fn notify(&self, event: Event) -> SubmitOutcome {
        self.sink.notify(event).await
    }

    /// Shorthand for `notify(derive(..))`.
    pub async fn emit(&self, event_type: impl Into<EventType>, data: impl Into<String>, parent: &Event) -> SubmitOutcome {
        let event = self.derive(event_type, data, parent);
        self.notify(event).await
    }
}

#[async_trait]
pub trait ReconModule: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn watches(&self) -> &BTreeSet<EventType> {
        &self.descriptor().watches
    }

    fn produces(&self) -> &BTreeSet<EventType> {
        &self.descriptor().produces
    }

    fn configure(&self, options: &ModuleOptions) -> Result<ModuleConfig, ModuleError> {
        ModuleConfig::from_schema(self.descriptor(), options)
    }

    async fn handle(&self, ctx: &ModuleContext, event: &Event) -> Result<(), ModuleError>;

    /// Called once at scan end. Must tolerate repeated calls.
    async fn shutdown(&self) {}
}
