// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Scan command
//!
//! Submits one scan to an in-process orchestrator, follows its live feed until
//! it reaches a terminal state and prints a summary. Ctrl-C cancels the scan.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

use argus_core::{
    application::ScanService,
    domain::{
        events::{PipelineEvent, ScanLifecycleEvent, WorkEvent},
        module::ModuleOptions,
        scan::{ScanId, ScanPriority, ScanRequest, ScanState, Target},
        work::WorkOutcome,
    },
    infrastructure::event_bus::{DomainEvent, EventBusError},
};

use crate::embedded::EmbeddedOrchestrator;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Target value (domain, IP address, email, ...)
    #[arg(value_name = "TARGET")]
    pub target: String,

    /// Target event type
    #[arg(short = 't', long = "type", default_value = "DOMAIN")]
    pub target_type: String,

    /// Modules to enable (default: every registered module)
    #[arg(short, long, value_delimiter = ',')]
    pub modules: Vec<String>,

    /// Admission priority (high, normal, low)
    #[arg(short, long, default_value = "normal")]
    pub priority: ScanPriority,

    /// Module option as MODULE.KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(short = 'o', long = "option", value_name = "MODULE.KEY=VALUE")]
    pub options: Vec<String>,

    /// Optional scan name
    #[arg(long)]
    pub name: Option<String>,

    /// Only print the summary
    #[arg(short, long)]
    pub quiet: bool,

    /// Print accepted events as JSON after the scan
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ScanArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut orchestrator = EmbeddedOrchestrator::new(config_path)?;
    let service = std::sync::Arc::clone(orchestrator.service());

    let target = Target::new(args.target_type.as_str(), &args.target).context("Invalid target")?;
    let modules = if args.modules.is_empty() {
        service
            .registry()
            .descriptors()
            .map(|d| d.name.clone())
            .collect()
    } else {
        args.modules.clone()
    };
    if modules.is_empty() {
        return Err(anyhow!(
            "No modules available. Declare modules in the configuration or pass --modules"
        ));
    }

    let mut request = ScanRequest::new(target, modules).with_priority(args.priority);
    if let Some(name) = &args.name {
        request = request.with_name(name);
    }
    for (module, options) in parse_options(&args.options)? {
        request = request.with_module_options(module, options);
    }

    // Subscribe before submitting so no lifecycle record is missed
    let mut feed = service.event_bus().subscribe();
    orchestrator.start();
    let scan_id = service.submit_scan(request).await.context("Scan was not admitted")?;

    println!("{} {}", "Scan queued:".bold(), scan_id.to_string().cyan());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                println!("{}", "Cancelling scan...".yellow());
                if let Err(e) = service.cancel(scan_id).await {
                    warn!(error = %e, "Cancel request rejected");
                }
            }
            event = feed.recv() => match event {
                Ok(event) if event.scan_id() == scan_id => {
                    if !args.quiet {
                        print_event(&event);
                    }
                    if is_terminal(&event) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(EventBusError::Lagged(n)) => warn!(dropped = n, "Live feed lagged"),
                Err(_) => break,
            }
        }
    }

    let scan = service.wait_for_completion(scan_id).await?;
    let events = service.scan_events(scan_id).await?;
    let log = service.module_log(scan_id, None).await?;

    println!();
    print_summary(scan_id, scan.status(), scan.failure.as_deref(), &events, &log);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&events)?);
    }

    orchestrator.shutdown().await;

    match scan.status() {
        ScanState::ErrorFailed => Err(anyhow!(
            "Scan failed: {}",
            scan.failure.unwrap_or_else(|| "unknown error".to_string())
        )),
        _ => Ok(()),
    }
}

/// Group `MODULE.KEY=VALUE` flags by module.
fn parse_options(raw: &[String]) -> Result<BTreeMap<String, ModuleOptions>> {
    let mut parsed: BTreeMap<String, ModuleOptions> = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Option '{}' must look like MODULE.KEY=VALUE", entry))?;
        let (module, name) = key
            .split_once('.')
            .ok_or_else(|| anyhow!("Option key '{}' must look like MODULE.KEY", key))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        parsed
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }
    Ok(parsed)
}

fn is_terminal(event: &DomainEvent) -> bool {
    matches!(
        event,
        DomainEvent::Scan(ScanLifecycleEvent::ScanStateChanged { to, .. }) if to.is_terminal()
    )
}

fn print_event(event: &DomainEvent) {
    match event {
        DomainEvent::Scan(ScanLifecycleEvent::ScanStateChanged { to, reason, .. }) => {
            let line = format!("── {} ", to);
            match reason {
                Some(reason) => println!("{}{}", line.bold(), reason.dimmed()),
                None => println!("{}", line.bold()),
            }
        }
        DomainEvent::Scan(ScanLifecycleEvent::ScanResolved {
            active_modules,
            excluded_modules,
            warnings,
            ..
        }) => {
            println!("   modules: {}", active_modules.join(", "));
            if !excluded_modules.is_empty() {
                println!("   excluded: {}", excluded_modules.join(", ").yellow());
            }
            for warning in warnings {
                println!("   {} {}", "warning:".yellow(), warning);
            }
        }
        DomainEvent::Scan(ScanLifecycleEvent::ScanQueued { .. }) => {}
        DomainEvent::Pipeline(PipelineEvent::EventAccepted {
            event_type,
            data,
            source_module,
            filtered,
            ..
        }) => {
            let marker = if filtered.is_some() { "~".dimmed() } else { "+".green() };
            println!(
                " {} {:<20} {}  {}",
                marker,
                event_type.cyan(),
                data,
                format!("<- {}", source_module).dimmed()
            );
        }
        DomainEvent::Pipeline(_) => {}
        DomainEvent::Work(WorkEvent::WorkItemFinished {
            module,
            event_type,
            outcome,
            ..
        }) => match outcome {
            WorkOutcome::Failed { error } => {
                println!(" {} {} on {}: {}", "!".red(), module, event_type, error);
            }
            WorkOutcome::TimedOut { after } => {
                println!(" {} {} on {} timed out after {:?}", "!".yellow(), module, event_type, after);
            }
            _ => {}
        },
        DomainEvent::Work(WorkEvent::ModuleDisabled { module, reason, .. }) => {
            println!(" {} {} disabled: {}", "x".red(), module.bold(), reason);
        }
    }
}

fn print_summary(
    scan_id: ScanId,
    status: ScanState,
    failure: Option<&str>,
    events: &[argus_core::domain::event::Event],
    log: &[argus_core::domain::repository::ModuleLogRecord],
) {
    let status_text = match status {
        ScanState::Finished => status.to_string().green(),
        ScanState::Aborted => status.to_string().yellow(),
        _ => status.to_string().red(),
    };
    println!("{}", "Scan summary".bold());
    println!("  ID:     {}", scan_id);
    println!("  Status: {}", status_text);
    if let Some(failure) = failure {
        println!("  Error:  {}", failure.red());
    }

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events.iter().filter(|e| !e.is_root()) {
        *by_type.entry(event.event_type().as_str()).or_default() += 1;
    }
    println!("  Events: {}", by_type.values().sum::<usize>());
    for (event_type, count) in by_type {
        println!("    {:<24} {}", event_type, count);
    }

    if !log.is_empty() {
        println!("  Module log:");
        for record in log {
            println!("    [{:?}] {}: {}", record.level, record.module, record.message);
        }
    }
}
