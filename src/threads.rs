//! Thread reconciler: provisions and releases thread workspaces.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{Action, Reconciler};
use crate::error::Error;
use crate::model::Thread;
use crate::store::Api;
use crate::workspace::WorkspaceFiles;

/// Finalizer guarding a thread's workspace.
pub const WORKSPACE_FINALIZER: &str = "knowledge-sync/thread-workspace";

pub struct ThreadReconciler {
    threads: Api<Thread>,
    workspace: Arc<dyn WorkspaceFiles>,
}

impl ThreadReconciler {
    pub fn new(threads: Api<Thread>, workspace: Arc<dyn WorkspaceFiles>) -> Self {
        Self { threads, workspace }
    }
}

#[async_trait]
impl Reconciler<Thread> for ThreadReconciler {
    async fn reconcile(&self, mut thread: Thread, _cancel: &CancellationToken) -> Result<Action, Error> {
        if thread.metadata.is_deleting() {
            if !thread.metadata.has_finalizer(WORKSPACE_FINALIZER) {
                return Ok(Action::Done);
            }
            if thread.workspace_ready() {
                self.workspace
                    .delete_workspace(&thread.status.workspace_id)
                    .await?;
                info!(thread = %thread.metadata.name, workspace = %thread.status.workspace_id, "Workspace deleted");
            }
            thread.metadata.remove_finalizer(WORKSPACE_FINALIZER);
            self.threads.update(&thread).await?;
            return Ok(Action::Done);
        }

        let mut changed = thread.metadata.add_finalizer(WORKSPACE_FINALIZER);
        let mut created = None;
        if !thread.workspace_ready() {
            let id = self.workspace.create_workspace().await?;
            thread.status.workspace_id = id.clone();
            created = Some(id);
            changed = true;
        }
        if changed {
            if let Err(e) = self.threads.update(&thread).await {
                // Lost the race; the next reconcile provisions again.
                if let Some(id) = created {
                    let _ = self.workspace.delete_workspace(&id).await;
                }
                return Err(e.into());
            }
            if let Some(id) = created {
                info!(thread = %thread.metadata.name, workspace = %id, "Workspace created");
            }
        }
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ObjectStore};
    use crate::workspace::MemoryWorkspace;

    fn setup() -> (ThreadReconciler, Api<Thread>, Arc<MemoryWorkspace>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let threads: Api<Thread> = Api::namespaced(store, "default");
        let workspace = Arc::new(MemoryWorkspace::new());
        (
            ThreadReconciler::new(threads.clone(), workspace.clone()),
            threads,
            workspace,
        )
    }

    #[tokio::test]
    async fn provisions_workspace_once() {
        let (reconciler, threads, workspace) = setup();
        let thread = threads
            .create(&Thread::for_source("default", "ks-docs", "docs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        reconciler.reconcile(thread, &cancel).await.unwrap();
        let ready = threads.get("ks-docs").await.unwrap();
        assert!(ready.workspace_ready());
        assert!(ready.metadata.has_finalizer(WORKSPACE_FINALIZER));
        assert!(workspace.exists(&ready.status.workspace_id).await);

        let version = ready.metadata.resource_version;
        reconciler.reconcile(ready, &cancel).await.unwrap();
        assert_eq!(
            threads.get("ks-docs").await.unwrap().metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn deletion_releases_workspace() {
        let (reconciler, threads, workspace) = setup();
        let thread = threads
            .create(&Thread::for_source("default", "ks-docs", "docs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        reconciler.reconcile(thread, &cancel).await.unwrap();
        let id = threads.get("ks-docs").await.unwrap().status.workspace_id;

        threads.delete("ks-docs").await.unwrap();
        let deleting = threads.get("ks-docs").await.unwrap();
        reconciler.reconcile(deleting, &cancel).await.unwrap();

        assert!(threads.get_opt("ks-docs").await.unwrap().is_none());
        assert!(!workspace.exists(&id).await);
    }
}
