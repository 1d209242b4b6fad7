// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Module catalogue commands
//!
//! Commands: list, resolve

use anyhow::{anyhow, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use argus_core::{
    application::resolver::resolve,
    domain::{config::OrchestratorConfigManifest, event::EventType},
};

use crate::embedded::build_registry;

#[derive(Subcommand)]
pub enum ModulesCommand {
    /// List registered modules
    List {
        /// Show watched/produced types and options
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show which modules a scan of the given target type would run
    Resolve {
        /// Target event type
        #[arg(value_name = "TARGET_TYPE", default_value = "DOMAIN")]
        target_type: String,

        /// Restrict to these modules (default: all)
        #[arg(short, long, value_delimiter = ',')]
        modules: Vec<String>,
    },
}

pub async fn handle_command(command: ModulesCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_path)?;
    let registry = build_registry(&config)?;

    match command {
        ModulesCommand::List { verbose } => {
            if registry.is_empty() {
                println!("{}", "No modules registered.".yellow());
                return Ok(());
            }
            println!("{}", format!("Modules ({}):", registry.len()).bold());
            for descriptor in registry.descriptors() {
                println!("  {} ({}) {}", descriptor.name.bold(), descriptor.kind, descriptor.summary.dimmed());
                if verbose {
                    let watches: Vec<String> = descriptor.watches.iter().map(ToString::to_string).collect();
                    let produces: Vec<String> = descriptor.produces.iter().map(ToString::to_string).collect();
                    println!("    watches:  {}", watches.join(", "));
                    println!("    produces: {}", produces.join(", "));
                    for option in &descriptor.options {
                        let required = if option.required { " (required)" } else { "" };
                        println!("    option:   {} {:?}{}", option.name, option.kind, required);
                    }
                }
            }
        }
        ModulesCommand::Resolve { target_type, modules } => {
            let selected: Vec<_> = if modules.is_empty() {
                registry.descriptors().collect()
            } else {
                modules
                    .iter()
                    .map(|name| registry.get(name).ok_or_else(|| anyhow!("Unknown module '{}'", name)))
                    .collect::<Result<_>>()?
            };

            let target_type = EventType::new(target_type);
            let resolution = resolve(&target_type, selected);

            println!("{} {}", "Resolution for".bold(), target_type.to_string().cyan());
            println!("  active:   {}", resolution.active.join(", ").green());
            if !resolution.excluded.is_empty() {
                println!("  excluded: {}", resolution.excluded.join(", ").yellow());
            }
            for warning in &resolution.warnings {
                println!("  {} {}", "warning:".yellow(), warning);
            }
            let reachable: Vec<String> = resolution.reachable_types.iter().map(ToString::to_string).collect();
            println!("  reachable types: {}", reachable.join(", "));

            println!("{}", "Routing:".bold());
            for event_type in resolution.index.watched_types() {
                println!("  {:<20} -> {}", event_type.to_string(), resolution.index.consumers_of(event_type).join(", "));
            }
            let wildcard = resolution.index.wildcard_consumers();
            if !wildcard.is_empty() {
                println!("  {:<20} -> {}", EventType::WILDCARD, wildcard.join(", "));
            }
        }
    }

    Ok(())
}
