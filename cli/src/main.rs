// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Argus CLI
//!
//! The `argus` binary runs reconnaissance scans with an in-process
//! orchestrator.
//!
//! ## Commands
//!
//! - `argus scan <TARGET>` - Run one scan and follow its live feed
//! - `argus modules list|resolve` - Inspect the module catalogue
//! - `argus config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use argus_core::domain::config::{ObservabilityConfig, OrchestratorConfigManifest};
use argus_orchestrator::commands::{self, ConfigCommand, ModulesCommand, ScanArgs};

/// Argus - OSINT reconnaissance orchestrator
#[derive(Parser)]
#[command(name = "argus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "ARGUS_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ARGUS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan against a target
    #[command(name = "scan")]
    Scan(ScanArgs),

    /// Module catalogue
    #[command(name = "modules")]
    Modules {
        #[command(subcommand)]
        command: ModulesCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Observability settings come from the manifest; a broken manifest is
    // reported by the command itself, after logging is up.
    let observability = cli
        .config
        .clone()
        .or_else(OrchestratorConfigManifest::discover_config)
        .and_then(|path| OrchestratorConfigManifest::from_yaml_file(path).ok())
        .and_then(|config| config.spec.observability)
        .unwrap_or_default();

    init_logging(cli.log_level.as_deref(), &observability)?;
    init_metrics(&observability)?;

    match cli.command {
        Some(Commands::Scan(args)) => commands::scan::execute(args, cli.config).await,
        Some(Commands::Modules { command }) => commands::modules::handle_command(command, cli.config).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level_override: Option<&str>, observability: &ObservabilityConfig) -> Result<()> {
    let logging = observability.logging.as_ref();
    let level = level_override
        .or_else(|| logging.map(|l| l.level.as_str()))
        .unwrap_or("info");
    let json = logging.is_some_and(|l| l.format.eq_ignore_ascii_case("json"));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

/// Install the Prometheus exporter when metrics are enabled
fn init_metrics(observability: &ObservabilityConfig) -> Result<()> {
    let Some(metrics) = observability.metrics.as_ref().filter(|m| m.enabled) else {
        return Ok(());
    };

    let addr: SocketAddr = metrics
        .listen_address
        .parse()
        .with_context(|| format!("Invalid metrics listen address '{}'", metrics.listen_address))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
