// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod modules;
pub mod repositories;
pub mod sandbox;
pub mod telemetry;

pub use event_bus::{DomainEvent, EventBus};
