//! Task invocation: start a data-source tool on a thread and follow it.
//!
//! A started task is represented by a `TaskHandle`. Its event channel closes
//! when the task is done; the terminal outcome is then read with `result()`.
//! Implementations drive the other end through a `TaskSender`.

pub mod process;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::InvokeError;
use crate::model::Thread;
use crate::progress::ProgressEvent;

pub use process::ProcessInvoker;

const EVENT_BUFFER: usize = 256;

/// Per-invocation options.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Workspace the task reads and writes.
    pub workspace_id: String,
    /// Authorized credential token, when the tool needs one.
    pub credential: Option<SecretString>,
    /// Extra environment for the task.
    pub env: BTreeMap<String, String>,
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("workspace_id", &self.workspace_id)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Starts external tasks.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Start `tool` on `thread` with `input`.
    async fn start_task(
        &self,
        thread: &Thread,
        tool: &str,
        input: &str,
        opts: TaskOptions,
    ) -> Result<TaskHandle, InvokeError>;
}

type Outcome = Result<String, InvokeError>;

/// Consumer side of one running task.
pub struct TaskHandle {
    thread_name: String,
    run_id: String,
    events: mpsc::Receiver<ProgressEvent>,
    result: Option<oneshot::Receiver<Outcome>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Create a connected handle/sender pair for a new run.
    pub fn channel(thread_name: impl Into<String>) -> (TaskHandle, TaskSender) {
        let run_id = format!("run-{}", uuid::Uuid::new_v4().simple());
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let handle = TaskHandle {
            thread_name: thread_name.into(),
            run_id: run_id.clone(),
            events: event_rx,
            result: Some(result_rx),
            cancel: cancel.clone(),
        };
        let sender = TaskSender {
            run_id,
            events: event_tx,
            result: result_tx,
            cancel,
        };
        (handle, sender)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Next progress event, or `None` once the task is done.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Wait for the task's terminal outcome.
    pub async fn result(&mut self, cancel: &CancellationToken) -> Result<String, InvokeError> {
        let Some(rx) = self.result.take() else {
            return Err(InvokeError::Failed("task result already taken".to_string()));
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(InvokeError::Cancelled),
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(InvokeError::Failed("task ended without a result".to_string()))
            }),
        }
    }

    /// Stop the task and release its resources. Safe to call repeatedly.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer side of one running task.
pub struct TaskSender {
    run_id: String,
    events: mpsc::Sender<ProgressEvent>,
    result: oneshot::Sender<Outcome>,
    cancel: CancellationToken,
}

impl TaskSender {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Fires when the consumer closes or drops the handle.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Emit a progress event stamped with this run. Returns `false` if
    /// nobody is listening any more.
    pub async fn send(&self, mut event: ProgressEvent) -> bool {
        event.run_id = self.run_id.clone();
        if event.time.is_none() {
            event.time = Some(Utc::now());
        }
        self.events.send(event).await.is_ok()
    }

    /// Report the outcome, emit `runComplete`, and close the event channel.
    pub async fn finish(self, outcome: Result<String, InvokeError>) {
        let mut done = ProgressEvent::run_complete(self.run_id.clone());
        if let Err(e) = &outcome {
            done.error = e.to_string();
        }
        done.time = Some(Utc::now());
        let _ = self.events.send(done).await;
        let _ = self.result.send(outcome);
    }
}
