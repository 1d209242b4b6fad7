// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Module kinds that can be declared in the orchestrator manifest.
//!
//! Native modules are registered in code. `tool` and `fixture` modules are
//! built here from their [`ModuleDefinition`]s.

pub mod fixture;
pub mod tool;

pub use fixture::FixtureModule;
pub use tool::ToolModule;

use std::sync::Arc;

use crate::application::registry::{ModuleRegistry, RegistryError};
use crate::domain::config::ModuleDefinition;
use crate::domain::module::{ModuleKind, ReconModule};

/// Register every manifest-declared module. Returns how many were added.
pub fn register_definitions(
    registry: &mut ModuleRegistry,
    definitions: &[ModuleDefinition],
) -> Result<usize, RegistryError> {
    for definition in definitions {
        register_definition(registry, definition)?;
    }
    Ok(definitions.len())
}

pub fn register_definition(registry: &mut ModuleRegistry, definition: &ModuleDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidDefinition {
        module: definition.name.clone(),
        reason: reason.to_string(),
    };
    let descriptor = definition.descriptor();

    match definition.kind {
        ModuleKind::Native => Err(invalid("native modules are registered in code")),
        ModuleKind::Tool => {
            if definition.command.is_empty() {
                return Err(invalid("tool modules need a command"));
            }
            let output_type = definition
                .output_type
                .clone()
                .ok_or_else(|| invalid("tool modules need an output_type"))?;
            let command = definition.command.clone();
            registry.register(move || {
                Arc::new(ToolModule::new(descriptor.clone(), command.clone(), output_type.clone())) as Arc<dyn ReconModule>
            })
        }
        ModuleKind::Fixture => {
            let fixtures = definition.fixtures.clone();
            registry.register(move || {
                Arc::new(FixtureModule::new(descriptor.clone(), fixtures.clone())) as Arc<dyn ReconModule>
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::FixtureEmission;
    use crate::domain::event::EventType;
    use std::collections::BTreeMap;

    fn definition(name: &str, kind: ModuleKind) -> ModuleDefinition {
        ModuleDefinition {
            name: name.to_string(),
            kind,
            summary: String::new(),
            watches: [EventType::new("DOMAIN")].into_iter().collect(),
            produces: Default::default(),
            limits: Default::default(),
            options: Vec::new(),
            command: Vec::new(),
            output_type: None,
            fixtures: BTreeMap::new(),
        }
    }

    #[test]
    fn test_fixture_definition_registers_with_derived_produces() {
        let mut def = definition("fixture_dns", ModuleKind::Fixture);
        def.fixtures.insert(
            "example.com".to_string(),
            vec![FixtureEmission {
                event_type: EventType::new("IP_ADDRESS"),
                data: "93.184.216.34".to_string(),
            }],
        );

        let mut registry = ModuleRegistry::new();
        assert_eq!(register_definitions(&mut registry, &[def]).unwrap(), 1);
        let descriptor = registry.get("fixture_dns").unwrap();
        assert!(descriptor.produces.contains(&EventType::new("IP_ADDRESS")));
    }

    #[test]
    fn test_incomplete_tool_definition_is_rejected() {
        let mut registry = ModuleRegistry::new();
        let mut def = definition("sublister", ModuleKind::Tool);
        def.command = vec!["sublist3r".into(), "-d".into(), "{data}".into()];

        let err = register_definition(&mut registry, &def).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { reason, .. } if reason.contains("output_type")));

        let native = definition("native", ModuleKind::Native);
        assert!(register_definition(&mut registry, &native).is_err());
        assert!(registry.is_empty());
    }
}
