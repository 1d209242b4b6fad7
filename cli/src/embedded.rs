// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-process orchestrator
//!
//! Builds the module registry and scan service from the loaded manifest and
//! runs them inside the CLI process.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use argus_core::{
    application::{ModuleRegistry, Repositories, StandardScanService},
    domain::config::OrchestratorConfigManifest,
    infrastructure::{event_bus::EventBus, modules::register_definitions},
};

pub struct EmbeddedOrchestrator {
    config: OrchestratorConfigManifest,
    service: Arc<StandardScanService>,
    scheduler: Option<JoinHandle<()>>,
}

impl EmbeddedOrchestrator {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = OrchestratorConfigManifest::load_or_default(config_path)
            .context("Failed to load configuration")?;
        Self::from_config(config)
    }

    pub fn from_config(config: OrchestratorConfigManifest) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;

        let registry = build_registry(&config)?;
        let service = Arc::new(StandardScanService::new(
            &config.spec,
            registry,
            Repositories::in_memory(),
            EventBus::with_default_capacity(),
        ));

        Ok(Self {
            config,
            service,
            scheduler: None,
        })
    }

    pub fn config(&self) -> &OrchestratorConfigManifest {
        &self.config
    }

    pub fn service(&self) -> &Arc<StandardScanService> {
        &self.service
    }

    /// Start pulling admitted scans. Idempotent.
    pub fn start(&mut self) {
        if self.scheduler.is_none() {
            self.scheduler = Some(self.service.start());
        }
    }

    pub async fn shutdown(mut self) {
        self.service.shutdown();
        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.await;
        }
    }
}

/// Registry with every module the manifest declares.
pub fn build_registry(config: &OrchestratorConfigManifest) -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    let count = register_definitions(&mut registry, &config.spec.modules)
        .context("Failed to register configured modules")?;
    tracing::debug!(count, "Registered configured modules");
    Ok(registry)
}
