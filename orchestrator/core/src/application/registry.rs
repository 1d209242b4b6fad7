// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Catalogue of modules the orchestrator can enable.
//!
//! The registry stores a descriptor and a factory per module. Every scan gets
//! fresh module instances from the factories, so per-scan state inside a
//! module never leaks into another scan.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::module::{ModuleDescriptor, ReconModule};

pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn ReconModule> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Module already registered: {0}")]
    Duplicate(String),

    #[error("Module definition '{module}' is invalid: {reason}")]
    InvalidDefinition { module: String, reason: String },
}

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    entries: BTreeMap<String, (ModuleDescriptor, ModuleFactory)>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. The descriptor is read from one probe instance.
    pub fn register<F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Arc<dyn ReconModule> + Send + Sync + 'static,
    {
        let descriptor = factory().descriptor().clone();
        if self.entries.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        tracing::debug!(module = %descriptor.name, kind = %descriptor.kind, "Registered module");
        self.entries
            .insert(descriptor.name.clone(), (descriptor, Arc::new(factory)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.entries.get(name).map(|(descriptor, _)| descriptor)
    }

    /// Fresh instance for one scan.
    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn ReconModule>> {
        self.entries.get(name).map(|(_, factory)| factory())
    }

    /// Sorted by name.
    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.entries.values().map(|(descriptor, _)| descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
