//! Top-level reconcile for knowledge sources: cleanup, sync, reschedule.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::FINALIZER;
use super::cleanup::cleanup;
use super::reschedule::reschedule;
use super::sync::{SyncController, SyncDeps};
use crate::config::SyncConfig;
use crate::controller::{Action, Reconciler};
use crate::error::Error;
use crate::model::{KnowledgeSource, KnowledgeSourceState};
use crate::retry::update_status_with_retry;

pub struct KnowledgeSourceReconciler {
    sync: SyncController,
}

impl KnowledgeSourceReconciler {
    pub fn new(deps: SyncDeps, config: SyncConfig) -> Self {
        Self {
            sync: SyncController::new(deps, config),
        }
    }

    pub fn sync_controller(&self) -> &SyncController {
        &self.sync
    }

    async fn ensure_finalizer(&self, source: KnowledgeSource) -> Result<KnowledgeSource, Error> {
        if source.metadata.has_finalizer(FINALIZER) {
            return Ok(source);
        }
        let mut source = source;
        source.metadata.add_finalizer(FINALIZER);
        Ok(self.sync.deps().sources.update(&source).await?)
    }
}

#[async_trait]
impl Reconciler<KnowledgeSource> for KnowledgeSourceReconciler {
    async fn reconcile(
        &self,
        source: KnowledgeSource,
        cancel: &CancellationToken,
    ) -> Result<Action, Error> {
        if source.metadata.is_deleting() {
            return cleanup(self.sync.deps(), self.sync.config(), &source).await;
        }

        let source = self.ensure_finalizer(source).await?;
        let source = self.sync.sync(source, cancel).await?;
        if !source.is_settled() {
            return Ok(Action::Done);
        }

        let mut next = source.clone();
        let wait = reschedule(&mut next.status, &source.spec.sync_schedule, Utc::now());
        if next.status != source.status {
            let stored = update_status_with_retry(
                &self.sync.deps().sources,
                &next,
                &self.sync.config().status_retry,
            )
            .await?;
            if stored.status.sync_state == KnowledgeSourceState::Pending {
                info!(source = %stored.metadata.name, "Scheduled sync is due");
                return Ok(Action::RequeueAfter(Duration::ZERO));
            }
        }

        match wait {
            Some(wait) => {
                debug!(source = %source.metadata.name, ?wait, "Next scheduled sync");
                Ok(Action::RequeueAfter(wait))
            }
            None => Ok(Action::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::invoker::testing::{Script, ScriptedInvoker, Step};
    use crate::model::{KnowledgeFile, KnowledgeSourceManifest, Thread};
    use crate::progress::ProgressHub;
    use crate::store::{Api, MemoryStore, ObjectStore};
    use crate::workspace::{MemoryWorkspace, WorkspaceFiles};

    struct Fixture {
        reconciler: KnowledgeSourceReconciler,
        sources: Api<KnowledgeSource>,
        threads: Api<Thread>,
        files: Api<KnowledgeFile>,
    }

    fn fixture(scripts: Vec<Script>) -> (Fixture, Arc<MemoryWorkspace>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let sources: Api<KnowledgeSource> = Api::namespaced(store, "default");
        let threads: Api<Thread> = sources.with_kind();
        let files: Api<KnowledgeFile> = sources.with_kind();
        let workspace = Arc::new(MemoryWorkspace::new());
        let deps = SyncDeps {
            sources: sources.clone(),
            threads: threads.clone(),
            files: files.clone(),
            invoker: Arc::new(ScriptedInvoker::new(workspace.clone(), scripts)),
            workspace: workspace.clone(),
            credentials: Arc::new(StaticCredentials::new()),
            hub: Arc::new(ProgressHub::new()),
        };
        let config = SyncConfig {
            checkpoint_interval: Duration::from_millis(20),
            wait_timeout: Duration::from_secs(2),
            cleanup_requeue: Duration::from_millis(10),
            ..Default::default()
        };
        (
            Fixture {
                reconciler: KnowledgeSourceReconciler::new(deps, config),
                sources,
                threads,
                files,
            },
            workspace,
        )
    }

    /// Pre-provision the backing thread so sync does not wait on it.
    async fn provision(f: &Fixture, workspace: &MemoryWorkspace) {
        let mut thread = Thread::for_source("default", "ks-docs", "docs");
        thread.status.workspace_id = workspace.create_workspace().await.unwrap();
        f.threads.create(&thread).await.unwrap();
    }

    fn one_file() -> serde_json::Value {
        serde_json::json!({"output": {"files": {"a": {"fileID": "a", "filePath": "a.txt"}}}})
    }

    #[tokio::test]
    async fn sync_adds_finalizer_and_settles() {
        let (f, ws) = fixture(vec![Script {
            steps: vec![Step::WriteMetadata(one_file())],
            outcome: Ok(String::new()),
        }]);
        provision(&f, &ws).await;
        let source = f
            .sources
            .create(&KnowledgeSource::new(
                "default",
                "docs",
                KnowledgeSourceManifest::Website { site_urls: vec![] },
            ))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let action = f.reconciler.reconcile(source, &cancel).await.unwrap();
        assert_eq!(action, Action::Done);

        let stored = f.sources.get("docs").await.unwrap();
        assert!(stored.metadata.has_finalizer(FINALIZER));
        assert_eq!(stored.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(f.files.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scheduled_source_requeues_until_due() {
        let (f, ws) = fixture(vec![Script {
            steps: vec![],
            outcome: Ok(String::new()),
        }]);
        provision(&f, &ws).await;
        let source = f
            .sources
            .create(
                &KnowledgeSource::new(
                    "default",
                    "docs",
                    KnowledgeSourceManifest::Website { site_urls: vec![] },
                )
                .with_schedule("0 * * * *"),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let action = f.reconciler.reconcile(source, &cancel).await.unwrap();
        let Action::RequeueAfter(wait) = action else {
            panic!("expected a requeue, got {action:?}");
        };
        assert!(wait <= Duration::from_secs(3600));

        let stored = f.sources.get("docs").await.unwrap();
        assert!(stored.status.next_sync_time.is_some());

        // Pretend the fire time has passed.
        let mut due = stored;
        due.status.next_sync_time = Some(Utc::now() - chrono::Duration::minutes(1));
        let due = f.sources.update(&due).await.unwrap();
        let action = f.reconciler.reconcile(due, &cancel).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(Duration::ZERO));
        let stored = f.sources.get("docs").await.unwrap();
        assert_eq!(stored.status.sync_state, KnowledgeSourceState::Pending);
        assert_eq!(stored.status.sync_generation, stored.spec.sync_generation);
    }

    #[tokio::test]
    async fn generation_bump_starts_before_scheduled_time() {
        let (f, ws) = fixture(vec![
            Script {
                steps: vec![Step::WriteMetadata(one_file())],
                outcome: Ok(String::new()),
            },
            Script {
                steps: vec![
                    Step::WriteMetadata(one_file()),
                    Step::Sleep(Duration::from_millis(150)),
                ],
                outcome: Ok(String::new()),
            },
        ]);
        provision(&f, &ws).await;
        let source = f
            .sources
            .create(
                &KnowledgeSource::new(
                    "default",
                    "docs",
                    KnowledgeSourceManifest::Website { site_urls: vec![] },
                )
                .with_schedule("0 * * * *"),
            )
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        f.reconciler.reconcile(source, &cancel).await.unwrap();

        let synced = f.sources.get("docs").await.unwrap();
        assert_eq!(synced.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(synced.status.sync_generation, 1);
        let first_run = synced.status.run_name.clone();
        let mut bumped = synced;
        bumped.status.next_sync_time = Some(Utc::now() + chrono::Duration::hours(1));
        bumped.spec.sync_generation = 2;
        let bumped = f.sources.update(&bumped).await.unwrap();

        let observed = {
            let sources = f.sources.clone();
            tokio::spawn(async move {
                loop {
                    let current = sources.get("docs").await.unwrap();
                    if current.status.sync_state == KnowledgeSourceState::Syncing {
                        return current;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };
        f.reconciler.reconcile(bumped, &cancel).await.unwrap();

        let running = observed.await.unwrap();
        assert!(running.status.next_sync_time.is_none());
        assert_ne!(running.status.run_name, first_run);

        let stored = f.sources.get("docs").await.unwrap();
        assert_eq!(stored.status.sync_state, KnowledgeSourceState::Synced);
        assert_eq!(stored.status.sync_generation, 2);
        assert_eq!(stored.status.run_name, running.status.run_name);
    }

    #[tokio::test]
    async fn deletion_removes_files_then_thread_then_finalizer() {
        let (f, ws) = fixture(vec![Script {
            steps: vec![Step::WriteMetadata(one_file())],
            outcome: Ok(String::new()),
        }]);
        provision(&f, &ws).await;
        let source = f
            .sources
            .create(&KnowledgeSource::new(
                "default",
                "docs",
                KnowledgeSourceManifest::Website { site_urls: vec![] },
            ))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        f.reconciler.reconcile(source, &cancel).await.unwrap();

        f.sources.delete("docs").await.unwrap();
        let deleting = f.sources.get("docs").await.unwrap();
        assert!(deleting.metadata.is_deleting());

        let action = f.reconciler.reconcile(deleting, &cancel).await.unwrap();
        assert!(matches!(action, Action::RequeueAfter(_)));
        assert!(f.files.list_all().await.unwrap().is_empty());
        assert!(f.threads.get_opt("ks-docs").await.unwrap().is_some());

        let deleting = f.sources.get("docs").await.unwrap();
        let action = f.reconciler.reconcile(deleting, &cancel).await.unwrap();
        assert_eq!(action, Action::Done);
        assert!(f.threads.get_opt("ks-docs").await.unwrap().is_none());
        assert!(f.sources.get_opt("docs").await.unwrap().is_none());
    }
}
