// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Module Graph Resolver
//!
//! Static analysis over the enabled modules' `watches` / `produces` sets,
//! run once per scan before any event is seeded.
//!
//! The result is a [`ConsumerIndex`] mapping each event type to the ordered
//! list of modules watching it, with wildcard watchers kept in a separate
//! entry that is consulted on every lookup. Modules that can never receive an
//! event are left out of the index and reported as [`ResolutionWarning`]s;
//! resolution itself never fails.
//!
//! Reachability is a fixed-point walk from the seed types (`ROOT` and the
//! target's type): a module is reachable when it watches a reachable type,
//! and its `produces` then become reachable too.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::domain::event::EventType;
use crate::domain::module::ModuleDescriptor;

/// Event type -> subscribed modules. Scan-scoped and immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ConsumerIndex {
    by_type: BTreeMap<EventType, Vec<String>>,
    wildcard: Vec<String>,
}

impl ConsumerIndex {
    fn add(&mut self, descriptor: &ModuleDescriptor) {
        if descriptor.watches_all() {
            self.wildcard.push(descriptor.name.clone());
        }
        for event_type in descriptor.watches.iter().filter(|t| !t.is_wildcard()) {
            self.by_type
                .entry(event_type.clone())
                .or_default()
                .push(descriptor.name.clone());
        }
    }

    /// Modules subscribed to `event_type`: explicit watchers first, then
    /// wildcard watchers, each module at most once.
    pub fn consumers_of(&self, event_type: &EventType) -> Vec<&str> {
        let mut consumers: Vec<&str> = self
            .by_type
            .get(event_type)
            .map(|modules| modules.iter().map(String::as_str).collect())
            .unwrap_or_default();
        for module in &self.wildcard {
            if !consumers.contains(&module.as_str()) {
                consumers.push(module);
            }
        }
        consumers
    }

    pub fn wildcard_consumers(&self) -> &[String] {
        &self.wildcard
    }

    pub fn watched_types(&self) -> impl Iterator<Item = &EventType> {
        self.by_type.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.wildcard.is_empty()
    }
}

/// Non-fatal findings from resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionWarning {
    /// The module declares no watched types at all.
    NoWatches { module: String },
    /// None of the module's watched types can ever be produced in this scan.
    Unreachable { module: String, watches: Vec<String> },
}

impl ResolutionWarning {
    pub fn module(&self) -> &str {
        match self {
            ResolutionWarning::NoWatches { module } | ResolutionWarning::Unreachable { module, .. } => module,
        }
    }
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionWarning::NoWatches { module } => write!(f, "module {} watches no event types", module),
            ResolutionWarning::Unreachable { module, watches } => write!(
                f,
                "module {} is unreachable: nothing in this scan produces {}",
                module,
                watches.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub index: ConsumerIndex,
    /// Modules that will receive work, in enable order.
    pub active: Vec<String>,
    /// Modules kept for diagnostics but never dispatched to.
    pub excluded: Vec<String>,
    pub warnings: Vec<ResolutionWarning>,
    /// Every event type that can appear in this scan.
    pub reachable_types: BTreeSet<EventType>,
}

impl Resolution {
    pub fn is_active(&self, module: &str) -> bool {
        self.active.iter().any(|m| m == module)
    }
}

/// Build the scan's consumer index from the enabled modules.
pub fn resolve<'a, I>(target_type: &EventType, modules: I) -> Resolution
where
    I: IntoIterator<Item = &'a ModuleDescriptor>,
{
    let modules: Vec<&ModuleDescriptor> = modules.into_iter().collect();
    let mut resolution = Resolution::default();

    let mut reachable: BTreeSet<EventType> = BTreeSet::new();
    reachable.insert(EventType::root());
    reachable.insert(target_type.clone());

    let mut activated = vec![false; modules.len()];
    loop {
        let mut changed = false;
        for (i, descriptor) in modules.iter().enumerate() {
            if activated[i] || descriptor.watches.is_empty() {
                continue;
            }
            let receives = descriptor.watches_all() || descriptor.watches.iter().any(|t| reachable.contains(t));
            if receives {
                activated[i] = true;
                changed = true;
                reachable.extend(descriptor.produces.iter().cloned());
            }
        }
        if !changed {
            break;
        }
    }

    for (descriptor, active) in modules.iter().zip(activated) {
        if descriptor.watches.is_empty() {
            tracing::warn!(module = %descriptor.name, "Enabled module watches no event types");
            resolution.warnings.push(ResolutionWarning::NoWatches {
                module: descriptor.name.clone(),
            });
            resolution.excluded.push(descriptor.name.clone());
        } else if active {
            resolution.index.add(descriptor);
            resolution.active.push(descriptor.name.clone());
        } else {
            let watches: Vec<String> = descriptor.watches.iter().map(|t| t.to_string()).collect();
            tracing::warn!(module = %descriptor.name, watches = ?watches, "Enabled module is unreachable from the target");
            resolution.warnings.push(ResolutionWarning::Unreachable {
                module: descriptor.name.clone(),
                watches,
            });
            resolution.excluded.push(descriptor.name.clone());
        }
    }

    resolution.reachable_types = reachable;
    resolution
}
