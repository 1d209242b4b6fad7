// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! External-tool module.
//!
//! Runs the configured command once per event. Each non-empty stdout line
//! becomes one event of the definition's `output_type`, derived from the
//! triggering event. The child is spawned with `kill_on_drop`, so a sandbox
//! timeout or an aborted worker also ends the process.
//!
//! Placeholders in the command line:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{data}` | triggering event's data |
//! | `{type}` | triggering event's type |
//! | `{target}` | scan target value |

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::domain::error::ModuleError;
use crate::domain::event::{Event, EventType};
use crate::domain::module::{ModuleContext, ModuleDescriptor, ReconModule};

/// Longest stderr tail quoted in a failure message.
const STDERR_TAIL: usize = 512;

pub struct ToolModule {
    descriptor: ModuleDescriptor,
    command: Vec<String>,
    output_type: EventType,
}

impl ToolModule {
    pub fn new(descriptor: ModuleDescriptor, command: Vec<String>, output_type: EventType) -> Self {
        Self {
            descriptor,
            command,
            output_type,
        }
    }

    fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    fn build(&self, ctx: &ModuleContext, event: &Event) -> Result<Command, ModuleError> {
        let expand = |part: &String| {
            part.replace("{data}", event.data())
                .replace("{type}", event.event_type().as_str())
                .replace("{target}", ctx.target().value())
        };
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ModuleError::Setup(format!("module {} has an empty command", self.descriptor.name)))?;

        let mut cmd = Command::new(expand(program));
        cmd.args(args.iter().map(expand))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ReconModule for ToolModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle(&self, ctx: &ModuleContext, event: &Event) -> Result<(), ModuleError> {
        let mut child = self
            .build(ctx, event)?
            .spawn()
            .map_err(|e| ModuleError::runtime(format!("failed to spawn {}: {}", self.program(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ModuleError::runtime("tool stdout not captured"))?;
        let stderr = child.stderr.take();
        // Drained concurrently so a chatty stderr cannot block the child
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut emitted = 0usize;
        loop {
            let line = tokio::select! {
                _ = ctx.cancelled() => {
                    let _ = child.start_kill();
                    return Err(ModuleError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    ctx.emit(self.output_type.clone(), line, event).await;
                    emitted += 1;
                }
                Ok(None) => break,
                Err(e) => return Err(ModuleError::runtime(format!("failed to read tool output: {}", e))),
            }
        }

        let status = tokio::select! {
            _ = ctx.cancelled() => {
                let _ = child.start_kill();
                return Err(ModuleError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| ModuleError::runtime(format!("failed to wait for tool: {}", e)))?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        debug!(module = %self.descriptor.name, status = %status, emitted, "Tool finished");
        if !status.success() {
            let tail: String = stderr
                .trim()
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(ModuleError::runtime(format!("{} exited with {}: {}", self.program(), status, tail)));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::event::SubmitOutcome;
    use crate::domain::module::{EventSink, ModuleConfig, ModuleKind};
    use crate::domain::scan::{ScanId, Target};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl EventSink for Collect {
        async fn notify(&self, event: Event) -> SubmitOutcome {
            self.0.lock().await.push(event.data().to_string());
            SubmitOutcome::Accepted {
                event_id: event.id(),
                sequence: 0,
                dispatched: 0,
                filtered: None,
            }
        }
    }

    fn tool(command: &[&str]) -> ToolModule {
        ToolModule::new(
            ModuleDescriptor::new("tool", ModuleKind::Tool).watching(["DOMAIN"]),
            command.iter().map(|s| s.to_string()).collect(),
            EventType::new("SUBDOMAIN"),
        )
    }

    fn context(sink: Arc<Collect>, cancel: CancellationToken) -> (ModuleContext, Event) {
        let target = Arc::new(Target::new("DOMAIN", "example.com").unwrap());
        let root = Event::root(&target);
        let event = Event::derived("DOMAIN", "example.com", "argus", &root);
        let ctx = ModuleContext::new(
            ScanId::new(),
            "tool",
            target,
            Arc::new(ModuleConfig::default()),
            sink,
            cancel,
        );
        (ctx, event)
    }

    #[tokio::test]
    async fn test_each_stdout_line_is_an_event() {
        let sink = Arc::new(Collect::default());
        let (ctx, event) = context(sink.clone(), CancellationToken::new());
        let module = tool(&["sh", "-c", "printf 'www.{data}\\n\\n  mail.{data}  \\n'"]);

        module.handle(&ctx, &event).await.unwrap();
        assert_eq!(*sink.0.lock().await, vec!["www.example.com", "mail.example.com"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let sink = Arc::new(Collect::default());
        let (ctx, event) = context(sink, CancellationToken::new());
        let module = tool(&["sh", "-c", "echo boom >&2; exit 3"]);

        let err = module.handle(&ctx, &event).await.unwrap_err();
        assert!(matches!(err, ModuleError::Runtime(ref msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let sink = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        let (ctx, event) = context(sink, cancel.clone());
        let module = tool(&["sleep", "30"]);

        let handle = tokio::spawn(async move { module.handle(&ctx, &event).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(result, Err(ModuleError::Cancelled));
    }
}
