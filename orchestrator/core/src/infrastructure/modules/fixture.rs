// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

// Deterministic module driven by a lookup table. Used for dry runs and tests:
// the same input always yields the same findings, so scan results can be
// asserted exactly.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::domain::config::FixtureEmission;
use crate::domain::error::ModuleError;
use crate::domain::event::Event;
use crate::domain::module::{ModuleContext, ModuleDescriptor, ReconModule};

/// Key matching any input that has no exact entry.
pub const FIXTURE_FALLBACK: &str = "*";

pub struct FixtureModule {
    descriptor: ModuleDescriptor,
    fixtures: BTreeMap<String, Vec<FixtureEmission>>,
}

impl FixtureModule {
    pub fn new(descriptor: ModuleDescriptor, fixtures: BTreeMap<String, Vec<FixtureEmission>>) -> Self {
        Self { descriptor, fixtures }
    }

    fn lookup(&self, data: &str) -> Option<&[FixtureEmission]> {
        self.fixtures
            .get(data)
            .or_else(|| self.fixtures.get(FIXTURE_FALLBACK))
            .map(Vec::as_slice)
    }
}

#[async_trait]
impl ReconModule for FixtureModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle(&self, ctx: &ModuleContext, event: &Event) -> Result<(), ModuleError> {
        let Some(emissions) = self.lookup(event.data()) else {
            return Ok(());
        };
        for emission in emissions {
            if ctx.is_cancelled() {
                return Err(ModuleError::Cancelled);
            }
            // `{data}` lets fallback rules derive from the input
            let data = emission.data.replace("{data}", event.data());
            ctx.emit(emission.event_type.clone(), data, event).await;
        }
        Ok(())
    }
}
