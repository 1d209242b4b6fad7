// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Scan aggregate, events, module contract and the persistence interfaces.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants; no runtime wiring

pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod module;
pub mod repository;
pub mod scan;
pub mod work;
