//! Sync controller: drives one knowledge source through a sync run.
//!
//! ```text
//! Pending ──start──▶ Syncing ──task ok──▶ Synced
//!    ▲                  │  └──task err──▶ Error
//!    └──crash recovery──┘
//! ```
//!
//! A reconcile that finds `Syncing` assumes the previous process died
//! mid-run and demotes to `Pending`; task handles never survive a restart.
//! While a task runs, its reported files and state are checkpointed at a
//! fixed interval without pruning. The final apply after a successful run
//! prunes files the tool stopped reporting.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metadata::{self, SyncOutput};
use crate::config::SyncConfig;
use crate::credentials::CredentialChecker;
use crate::error::{Error, InvokeError};
use crate::invoker::{Invoker, TaskHandle, TaskOptions};
use crate::model::{KnowledgeFile, KnowledgeSource, KnowledgeSourceState, Thread};
use crate::progress::ProgressHub;
use crate::retry::update_status_with_retry;
use crate::store::Api;
use crate::wait::wait_for;
use crate::workspace::WorkspaceFiles;

/// Collaborators of the sync controller.
#[derive(Clone)]
pub struct SyncDeps {
    pub sources: Api<KnowledgeSource>,
    pub threads: Api<Thread>,
    pub files: Api<KnowledgeFile>,
    pub invoker: Arc<dyn Invoker>,
    pub workspace: Arc<dyn WorkspaceFiles>,
    pub credentials: Arc<dyn CredentialChecker>,
    pub hub: Arc<ProgressHub>,
}

pub struct SyncController {
    deps: SyncDeps,
    config: SyncConfig,
}

impl SyncController {
    pub fn new(deps: SyncDeps, config: SyncConfig) -> Self {
        Self { deps, config }
    }

    pub fn deps(&self) -> &SyncDeps {
        &self.deps
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Bring `source` to a settled state for its desired generation.
    ///
    /// Returns the latest stored object. Blocks for the whole task run. On
    /// cancellation the source is left in `Syncing` for crash recovery.
    pub async fn sync(
        &self,
        mut source: KnowledgeSource,
        cancel: &CancellationToken,
    ) -> Result<KnowledgeSource, Error> {
        if source.status.sync_state == KnowledgeSourceState::Syncing {
            info!(source = %source.metadata.name, "Found interrupted sync, resetting to pending");
            source.status.sync_state = KnowledgeSourceState::Pending;
            source = self.deps.sources.update(&source).await?;
        }

        if source.is_settled() || source.metadata.is_deleting() {
            return Ok(source);
        }

        let manifest = source.spec.manifest.clone();
        let credential = match manifest.required_credential() {
            Some(name) => {
                match self
                    .deps
                    .credentials
                    .token(&source.metadata.namespace, name)
                    .await
                {
                    Some(token) => Some(token),
                    None => {
                        debug!(source = %source.metadata.name, credential = name, "Credential not authorized, deferring sync");
                        return Ok(source);
                    }
                }
            }
            None => None,
        };

        let thread = self.ensure_thread(&source, cancel).await?;
        let workspace_id = thread.status.workspace_id.clone();
        let generation = source.spec.sync_generation;

        let seed = metadata::initial_metadata(&manifest, &source.status.sync_details)?;
        self.deps
            .workspace
            .write(&workspace_id, &self.config.metadata_path, &seed)
            .await?;

        let input = serde_json::to_string(&manifest)
            .map_err(|e| Error::Invoke(InvokeError::Failed(e.to_string())))?;
        let opts = TaskOptions {
            workspace_id: workspace_id.clone(),
            credential,
            ..Default::default()
        };
        let mut task = match self
            .deps
            .invoker
            .start_task(&thread, manifest.tool_reference(), &input, opts)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                warn!(source = %source.metadata.name, error = %e, "Failed to start sync task");
                let now = Utc::now();
                source.status.last_sync_start_time = Some(now);
                source.status.last_sync_end_time = Some(now);
                source.status.next_sync_time = None;
                source.status.sync_generation = generation;
                source.status.sync_state = KnowledgeSourceState::Error;
                source.status.error = e.to_string();
                return Ok(update_status_with_retry(
                    &self.deps.sources,
                    &source,
                    &self.config.status_retry,
                )
                .await?);
            }
        };

        source.status.sync_state = KnowledgeSourceState::Syncing;
        source.status.last_sync_start_time = Some(Utc::now());
        source.status.last_sync_end_time = None;
        source.status.next_sync_time = None;
        source.status.error.clear();
        source.status.thread_name = thread.metadata.name.clone();
        source.status.workspace_id = workspace_id.clone();
        source.status.run_name = task.run_id().to_string();
        source = match self.deps.sources.update(&source).await {
            Ok(stored) => stored,
            Err(e) => {
                task.close();
                return Err(e.into());
            }
        };
        info!(
            source = %source.metadata.name,
            generation,
            run = %task.run_id(),
            tool = manifest.tool_reference(),
            "Sync started"
        );

        let result = self.follow_task(&mut source, &mut task, cancel).await;
        task.close();
        let result = result?;

        self.finish(source, generation, result).await
    }

    async fn ensure_thread(
        &self,
        source: &KnowledgeSource,
        cancel: &CancellationToken,
    ) -> Result<Thread, Error> {
        let name = source.thread_name();
        let template = Thread::for_source(
            source.metadata.namespace.clone(),
            name.clone(),
            source.metadata.name.clone(),
        );
        let thread = wait_for(
            &self.deps.threads,
            &name,
            Some(template),
            self.config.wait_timeout,
            cancel,
            Thread::workspace_ready,
        )
        .await?;
        Ok(thread)
    }

    /// Forward task events and checkpoint until the task is done, then
    /// collect its outcome.
    async fn follow_task(
        &self,
        source: &mut KnowledgeSource,
        task: &mut TaskHandle,
        cancel: &CancellationToken,
    ) -> Result<Result<String, InvokeError>, Error> {
        let period = self.config.checkpoint_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let thread = task.thread_name().to_string();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = task.next_event() => match event {
                    Some(event) => self.deps.hub.publish(&thread, event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint(source, false).await {
                        warn!(source = %source.metadata.name, error = %e, "Checkpoint failed");
                    }
                }
            }
        }

        match task.result(cancel).await {
            Err(InvokeError::Cancelled) if cancel.is_cancelled() => Err(Error::Cancelled),
            outcome => Ok(outcome),
        }
    }

    /// Persist what the tool has reported so far.
    ///
    /// Returns the tool's output, or `None` if it has not written any yet.
    async fn checkpoint(
        &self,
        source: &mut KnowledgeSource,
        prune: bool,
    ) -> Result<Option<SyncOutput>, Error> {
        let Some(content) = self
            .deps
            .workspace
            .read(&source.status.workspace_id, &self.config.metadata_path)
            .await?
        else {
            return Ok(None);
        };
        let output = metadata::parse(&content)?.output;

        let stats = metadata::apply_files(&self.deps.files, source, &output.files, prune).await?;
        source.status.status = output.status.clone();
        source.status.sync_details = metadata::compress_state(&output.state)?;
        *source =
            update_status_with_retry(&self.deps.sources, source, &self.config.status_retry).await?;

        debug!(
            source = %source.metadata.name,
            files = output.files.len(),
            created = stats.created,
            pruned = stats.pruned,
            prune,
            "Checkpointed sync progress"
        );
        Ok(Some(output))
    }

    /// Final apply and terminal status.
    async fn finish(
        &self,
        mut source: KnowledgeSource,
        generation: i64,
        result: Result<String, InvokeError>,
    ) -> Result<KnowledgeSource, Error> {
        let mut failure = result.err().map(|e| e.to_string());

        match self.checkpoint(&mut source, failure.is_none()).await {
            Ok(Some(output)) if failure.is_none() && !output.error.is_empty() => {
                failure = Some(output.error);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(source = %source.metadata.name, error = %e, "Final metadata apply failed");
                if failure.is_none() {
                    failure = Some(e.to_string());
                }
            }
        }

        source.status.last_sync_end_time = Some(Utc::now());
        source.status.sync_generation = generation;
        match &failure {
            None => {
                source.status.sync_state = KnowledgeSourceState::Synced;
                source.status.error.clear();
            }
            Some(message) => {
                source.status.sync_state = KnowledgeSourceState::Error;
                source.status.error = message.clone();
            }
        }

        let stored =
            update_status_with_retry(&self.deps.sources, &source, &self.config.status_retry)
                .await?;
        info!(
            source = %stored.metadata.name,
            generation,
            state = %stored.status.sync_state,
            error = %stored.status.error,
            "Sync finished"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::invoker::testing::{Script, ScriptedInvoker, Step};
    use crate::model::{KnowledgeSourceManifest, SOURCE_NAME_FIELD};
    use crate::progress::Scope;
    use crate::store::{FieldSelector, MemoryStore, ObjectStore};
    use crate::workspace::MemoryWorkspace;

    struct Harness {
        controller: SyncController,
        sources: Api<KnowledgeSource>,
        threads: Api<Thread>,
        files: Api<KnowledgeFile>,
        invoker: Arc<ScriptedInvoker>,
        credentials: Arc<StaticCredentials>,
        hub: Arc<ProgressHub>,
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            checkpoint_interval: Duration::from_millis(20),
            wait_timeout: Duration::from_secs(2),
            status_retry: crate::config::RetryPolicy {
                attempts: 20,
                delay: Duration::from_millis(1),
                jitter: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    async fn harness(scripts: Vec<Script>) -> Harness {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let sources: Api<KnowledgeSource> = Api::namespaced(Arc::clone(&store), "default");
        let threads: Api<Thread> = sources.with_kind();
        let files: Api<KnowledgeFile> = sources.with_kind();
        let workspace = Arc::new(MemoryWorkspace::new());
        let invoker = Arc::new(ScriptedInvoker::new(workspace.clone(), scripts));
        let credentials = Arc::new(StaticCredentials::new());
        let hub = Arc::new(ProgressHub::new());

        // Stand-in for the thread reconciler: provision as soon as created.
        {
            let threads = threads.clone();
            let workspace = workspace.clone();
            let mut watch = threads.watch(FieldSelector::default()).await.unwrap();
            tokio::spawn(async move {
                while let Some(event) = watch.next().await {
                    if let crate::store::WatchEvent::Added(mut thread) = event {
                        thread.status.workspace_id = workspace.create_workspace().await.unwrap();
                        let _ = threads.update(&thread).await;
                    }
                }
            });
        }

        let deps = SyncDeps {
            sources: sources.clone(),
            threads: threads.clone(),
            files: files.clone(),
            invoker: invoker.clone(),
            workspace,
            credentials: credentials.clone(),
            hub: hub.clone(),
        };
        Harness {
            controller: SyncController::new(deps, fast_config()),
            sources,
            threads,
            files,
            invoker,
            credentials,
            hub,
        }
    }

    fn website() -> KnowledgeSource {
        KnowledgeSource::new(
            "default",
            "docs",
            KnowledgeSourceManifest::Website {
                site_urls: vec!["https://example.com".into()],
            },
        )
    }

    fn tool_output(paths: &[&str]) -> serde_json::Value {
        let files: serde_json::Map<String, serde_json::Value> = paths
            .iter()
            .map(|p| {
                (
                    p.to_string(),
                    json!({"fileID": p, "filePath": p, "url": format!("https://example.com/{p}"),
                           "checksum": "c1", "sizeInBytes": 3}),
                )
            })
            .collect();
        json!({"output": {"files": files, "status": format!("{} files", paths.len()),
                          "state": {"cursor": paths.len()}}})
    }

    async fn file_names(files: &Api<KnowledgeFile>) -> Vec<String> {
        let mut names: Vec<String> = files
            .list(FieldSelector::default().field(SOURCE_NAME_FIELD, "docs"))
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.spec.file_name)
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn failed_task_keeps_discovered_files() {
        let h = harness(vec![Script {
            steps: vec![
                Step::WriteMetadata(tool_output(&["a.txt", "b.txt"])),
                Step::Emit("found 2 files".into()),
            ],
            outcome: Err("provider returned 500".into()),
        }])
        .await;
        let source = h.sources.create(&website()).await.unwrap();

        let cancel = CancellationToken::new();
        let done = h.controller.sync(source, &cancel).await.unwrap();

        assert_eq!(done.status.sync_state, KnowledgeSourceState::Error);
        assert_eq!(done.status.sync_generation, 1);
        assert_eq!(done.status.error, "provider returned 500");
        assert!(done.status.last_sync_end_time.is_some());
        assert_eq!(done.status.thread_name, "ks-docs");
        assert!(!done.status.run_name.is_empty());
        assert_eq!(file_names(&h.files).await, vec!["a.txt", "b.txt"]);

        // Progress was forwarded under the run's id.
        let (history, _) = h.hub.subscribe(Scope::Run(done.status.run_name.clone())).await;
        assert!(history.iter().any(|e| e.content == "found 2 files"));
        assert!(history.last().unwrap().run_complete);
    }

    #[tokio::test]
    async fn successful_task_prunes_and_settles() {
        let h = harness(vec![
            Script {
                steps: vec![Step::WriteMetadata(tool_output(&["a.txt", "b.txt"]))],
                outcome: Ok(String::new()),
            },
            Script {
                steps: vec![Step::WriteMetadata(tool_output(&["a.txt"]))],
                outcome: Ok(String::new()),
            },
        ])
        .await;
        let source = h.sources.create(&website()).await.unwrap();
        let cancel = CancellationToken::new();

        let done = h.controller.sync(source, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(done.status.status, "2 files");
        assert!(!done.status.sync_details.is_empty());
        assert_eq!(file_names(&h.files).await, vec!["a.txt", "b.txt"]);

        // Settled at this generation: nothing to do.
        let again = h.controller.sync(done, &cancel).await.unwrap();
        assert_eq!(h.invoker.start_count().await, 1);

        // A new generation re-runs and prunes b.txt.
        let mut bumped = again;
        bumped.spec.sync_generation = 2;
        let bumped = h.sources.update(&bumped).await.unwrap();
        let done = h.controller.sync(bumped, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(done.status.sync_generation, 2);
        assert_eq!(file_names(&h.files).await, vec!["a.txt"]);
        assert_eq!(h.invoker.start_count().await, 2);
    }

    #[tokio::test]
    async fn checkpoints_while_running() {
        let h = harness(vec![Script {
            steps: vec![
                Step::WriteMetadata(tool_output(&["a.txt"])),
                Step::Sleep(Duration::from_millis(150)),
            ],
            outcome: Ok(String::new()),
        }])
        .await;
        let source = h.sources.create(&website()).await.unwrap();
        let cancel = CancellationToken::new();

        let sync = {
            let sources = h.sources.clone();
            let files = h.files.clone();
            tokio::spawn(async move {
                // Observe an intermediate checkpoint while the task sleeps.
                loop {
                    let current = sources.get("docs").await.unwrap();
                    if current.status.sync_state == KnowledgeSourceState::Syncing
                        && current.status.status == "1 files"
                    {
                        return files.list_all().await.unwrap().len();
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let done = h.controller.sync(source, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(sync.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_credential_defers_without_state_change() {
        let h = harness(vec![Script {
            steps: vec![],
            outcome: Ok(String::new()),
        }])
        .await;
        let notion = KnowledgeSource::new("default", "docs", KnowledgeSourceManifest::Notion {});
        let source = h.sources.create(&notion).await.unwrap();
        let cancel = CancellationToken::new();

        let deferred = h.controller.sync(source, &cancel).await.unwrap();
        assert_eq!(deferred.status.sync_state, KnowledgeSourceState::Pending);
        assert_eq!(deferred.metadata.resource_version, 1);
        assert_eq!(h.invoker.start_count().await, 0);
        assert!(h.threads.get_opt("ks-docs").await.unwrap().is_none());

        h.credentials
            .authorize("default", "notion", SecretString::from("tok".to_string()))
            .await;
        let done = h.controller.sync(deferred, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Synced);
    }

    #[tokio::test]
    async fn interrupted_sync_is_recovered() {
        let h = harness(vec![Script {
            steps: vec![Step::WriteMetadata(tool_output(&["a.txt"]))],
            outcome: Ok(String::new()),
        }])
        .await;
        let mut source = website();
        source.status.sync_state = KnowledgeSourceState::Syncing;
        let source = h.sources.create(&source).await.unwrap();

        let cancel = CancellationToken::new();
        let done = h.controller.sync(source, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(done.status.sync_generation, 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_syncing() {
        let h = harness(vec![Script {
            steps: vec![Step::Hang],
            outcome: Ok(String::new()),
        }])
        .await;
        let source = h.sources.create(&website()).await.unwrap();
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            let controller = h.controller;
            tokio::spawn(async move { controller.sync(source, &cancel).await })
        };
        loop {
            let current = h.sources.get("docs").await.unwrap();
            if current.status.sync_state == KnowledgeSourceState::Syncing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        let current = h.sources.get("docs").await.unwrap();
        assert_eq!(current.status.sync_state, KnowledgeSourceState::Syncing);
    }

    #[tokio::test]
    async fn start_failure_is_recorded() {
        let h = harness(vec![]).await;
        let source = h.sources.create(&website()).await.unwrap();
        let cancel = CancellationToken::new();

        let done = h.controller.sync(source, &cancel).await.unwrap();
        assert_eq!(done.status.sync_state, KnowledgeSourceState::Error);
        assert_eq!(done.status.sync_generation, 1);
        assert!(done.status.error.contains("website-data-source"));
    }
}
