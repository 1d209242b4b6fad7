// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use argus_core::domain::config::OrchestratorConfigManifest;

use crate::embedded::build_registry;

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./argus-config.yaml)
        #[arg(short, long, default_value = "./argus-config.yaml")]
        output: PathBuf,

        /// Include example module definitions
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. ARGUS_CONFIG_PATH: {}",
            std::env::var("ARGUS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./argus-config.yaml");
        println!("  4. ~/.argus/config.yaml");
        println!("  5. /etc/argus/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{} {}", "Current configuration:".bold(), config.metadata.name);
    println!();

    println!("{}", "Engine:".bold());
    println!("  Threads per scan: {}", spec.engine.max_threads);
    println!("  Cancel grace: {}s", spec.engine.cancel_grace_secs);
    println!("  Timeout strikes before disable: {}", spec.engine.max_timeout_strikes);
    println!(
        "  Consecutive failures before disable: {}",
        spec.engine.max_consecutive_failures
    );
    println!();

    println!("{}", "Sandbox:".bold());
    println!("  Global thread budget: {}", spec.sandbox.global_thread_budget);
    println!("  Default timeout: {}s", spec.sandbox.default_timeout_secs);
    match spec.sandbox.default_runtime_budget_secs {
        Some(secs) => println!("  Default runtime budget: {}s", secs),
        None => println!("  Default runtime budget: {}", "(unlimited)".dimmed()),
    }
    println!();

    println!("{}", "Admission:".bold());
    println!("  Running scans: {}", spec.admission.max_running_scans);
    println!(
        "  Queue depth: elevated at {}, critical at {}, ceiling {}",
        spec.admission.elevated_depth, spec.admission.critical_depth, spec.admission.max_queue_depth
    );
    println!();

    println!("{}", "Pipeline:".bold());
    println!("  Min confidence: {}", spec.pipeline.min_confidence);
    println!("  Min visibility: {}", spec.pipeline.min_visibility);
    println!("  Suppress false positives: {}", spec.pipeline.suppress_false_positives);
    if let Some(depth) = spec.pipeline.max_depth {
        println!("  Max depth: {}", depth);
    }
    println!();

    println!("{}", "Modules:".bold());
    if spec.modules.is_empty() {
        println!("  {}", "(none declared)".dimmed());
    }
    for module in &spec.modules {
        println!("  {} ({})", module.name.bold(), module.kind);
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;
    let registry = build_registry(&config)?;

    println!(
        "{}",
        format!("✓ Configuration is valid ({} modules)", registry.len()).green()
    );

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_parse_and_validate() {
        for template in [MINIMAL_TEMPLATE, EXAMPLES_TEMPLATE] {
            let config = OrchestratorConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
            build_registry(&config).unwrap();
        }
    }

    #[test]
    fn test_example_template_declares_modules() {
        let config = OrchestratorConfigManifest::from_yaml_str(EXAMPLES_TEMPLATE).unwrap();
        let registry = build_registry(&config).unwrap();
        assert!(registry.contains("fixture_subdomains"));
        assert!(registry.contains("tool_dig"));
    }

    #[tokio::test]
    async fn test_generate_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus-config.yaml");
        generate(path.clone(), false).await.unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, MINIMAL_TEMPLATE);
    }
}
