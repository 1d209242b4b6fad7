// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Scan orchestration use cases built on the domain types.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Resolver, pipeline, engine, admission and lifecycle services

pub mod admission;
pub mod engine;
pub mod pipeline;
pub mod registry;
pub mod repository_factory;
pub mod resolver;
pub mod scan_service;
pub mod state_machine;

// Re-export use cases for convenience
pub use admission::{AdmissionDecision, AdmissionQueue, PressureLevel};
pub use registry::ModuleRegistry;
pub use repository_factory::Repositories;
pub use scan_service::{ScanService, ScanServiceError, StandardScanService};
