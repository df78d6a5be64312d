//! Runs data-source tools as shell commands inside the thread's workspace.
//!
//! Each stdout line becomes a content event. On a non-zero exit, stderr is
//! the failure message. Closing the handle kills the process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::{Invoker, TaskHandle, TaskOptions};
use crate::error::InvokeError;
use crate::model::Thread;
use crate::progress::ProgressEvent;
use crate::workspace::WorkspaceFiles;

/// Invoker backed by local shell commands, one per tool reference.
pub struct ProcessInvoker {
    workspace: Arc<dyn WorkspaceFiles>,
    commands: HashMap<String, String>,
}

impl ProcessInvoker {
    pub fn new(workspace: Arc<dyn WorkspaceFiles>, commands: HashMap<String, String>) -> Self {
        Self {
            workspace,
            commands,
        }
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn start_task(
        &self,
        thread: &Thread,
        tool: &str,
        input: &str,
        opts: TaskOptions,
    ) -> Result<TaskHandle, InvokeError> {
        let cmd = self
            .commands
            .get(tool)
            .ok_or_else(|| InvokeError::ToolNotFound {
                name: tool.to_string(),
            })?;
        let workdir =
            self.workspace
                .local_dir(&opts.workspace_id)
                .ok_or_else(|| InvokeError::StartFailed {
                    tool: tool.to_string(),
                    reason: format!("workspace {} has no local directory", opts.workspace_id),
                })?;

        let (handle, sender) = TaskHandle::channel(thread.metadata.name.clone());

        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .current_dir(&workdir)
            .env("KSYNC_INPUT", input)
            .env("KSYNC_THREAD", &thread.metadata.name)
            .env("KSYNC_RUN_ID", sender.run_id())
            .env("KSYNC_WORKSPACE_DIR", &workdir)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &opts.credential {
            command.env("KSYNC_CREDENTIAL", token.expose_secret());
        }

        let mut child = command.spawn().map_err(|e| InvokeError::StartFailed {
            tool: tool.to_string(),
            reason: e.to_string(),
        })?;
        info!(tool, run = %sender.run_id(), thread = %thread.metadata.name, "Task process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tool = tool.to_string();

        tokio::spawn(async move {
            let cancel = sender.cancellation();
            let stderr_task = tokio::spawn(async move {
                let mut text = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut text).await;
                }
                text
            });

            let mut output = String::new();
            let mut cancelled = false;
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout);
                let mut raw = Vec::new();
                loop {
                    raw.clear();
                    let read = tokio::select! {
                        _ = cancel.cancelled() => {
                            cancelled = true;
                            break;
                        }
                        read = reader.read_until(b'\n', &mut raw) => read,
                    };
                    match read {
                        Ok(0) => break,
                        Ok(_) => {
                            // Tools may print bytes that are not UTF-8.
                            let line = String::from_utf8_lossy(&raw);
                            let line = line.trim_end_matches('\n').trim_end_matches('\r');
                            output.push_str(line);
                            output.push('\n');
                            sender
                                .send(ProgressEvent::content("", format!("{line}\n")))
                                .await;
                        }
                        Err(e) => {
                            warn!(tool = %tool, error = %e, "Failed reading task output");
                            break;
                        }
                    }
                }
            }

            let status = if cancelled {
                None
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    status = child.wait() => Some(status),
                }
            };

            let Some(status) = status else {
                let _ = child.kill().await;
                stderr_task.abort();
                sender.finish(Err(InvokeError::Cancelled)).await;
                return;
            };

            let stderr = stderr_task.await.unwrap_or_default();
            let outcome = match status {
                Ok(s) if s.success() => Ok(output),
                Ok(s) => {
                    let message = stderr.trim();
                    Err(InvokeError::Failed(if message.is_empty() {
                        format!("{tool} exited with {s}")
                    } else {
                        message.to_string()
                    }))
                }
                Err(e) => Err(InvokeError::Failed(e.to_string())),
            };
            sender.finish(outcome).await;
        });

        Ok(handle)
    }
}
