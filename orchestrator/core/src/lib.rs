// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Orchestration core for the Argus reconnaissance engine: module resolution,
//! the per-scan event pipeline, the sandboxed execution engine, scan admission
//! and the scan lifecycle state machine.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library entry point for the `argus` CLI and embedders

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
