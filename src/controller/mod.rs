//! Reconcile runtime.
//!
//! A `Controller` lists and watches one kind, feeds object names into a
//! `WorkQueue`, and runs a pool of workers that hand each object to a
//! `Reconciler`. The queue never gives the same name to two workers, so a
//! reconciler sees at most one reconcile per object at a time.

pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::model::Resource;
use crate::store::{Api, FieldSelector, WatchEvent};

pub use queue::WorkQueue;

/// Delay before re-opening a failed watch.
const WATCH_RETRY: Duration = Duration::from_secs(1);

/// What to do with an object after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change.
    Done,
    /// Reconcile again after the delay.
    RequeueAfter(Duration),
}

/// Drives objects of one kind toward their desired state.
#[async_trait]
pub trait Reconciler<K: Resource>: Send + Sync {
    async fn reconcile(&self, obj: K, cancel: &CancellationToken) -> Result<Action, Error>;
}

pub struct Controller<K: Resource> {
    api: Api<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    queue: Arc<WorkQueue>,
    workers: usize,
    resync: Duration,
}

impl<K: Resource> Controller<K> {
    pub fn new(
        api: Api<K>,
        reconciler: Arc<dyn Reconciler<K>>,
        workers: usize,
        resync: Duration,
    ) -> Self {
        Self {
            api,
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            workers: workers.max(1),
            resync,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(kind = K::KIND, workers = self.workers, "Controller started");

        let mut handles = Vec::with_capacity(self.workers + 1);
        for id in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                id,
                self.api.clone(),
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(watch_loop(
            self.api.clone(),
            Arc::clone(&self.queue),
            self.resync,
            cancel.clone(),
        )));

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(kind = K::KIND, error = %e, "Controller task panicked");
            }
        }
        info!(kind = K::KIND, "Controller stopped");
    }
}

/// Keep the queue fed: watch, then list, then follow the watch until it
/// fails or the resync interval elapses.
async fn watch_loop<K: Resource>(
    api: Api<K>,
    queue: Arc<WorkQueue>,
    resync: Duration,
    cancel: CancellationToken,
) {
    loop {
        let mut watch = match api.watch(FieldSelector::default()).await {
            Ok(watch) => watch,
            Err(e) => {
                warn!(kind = K::KIND, error = %e, "Failed to open watch");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RETRY) => continue,
                }
            }
        };

        match api.list_all().await {
            Ok(objects) => {
                debug!(kind = K::KIND, count = objects.len(), "Listed objects");
                for obj in &objects {
                    queue.add(obj.name()).await;
                }
            }
            Err(e) => warn!(kind = K::KIND, error = %e, "Failed to list objects"),
        }

        let resync_timer = tokio::time::sleep(resync);
        tokio::pin!(resync_timer);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut resync_timer => break,
                event = watch.next() => match event {
                    Some(WatchEvent::Added(obj))
                    | Some(WatchEvent::Modified(obj))
                    | Some(WatchEvent::Deleted(obj)) => queue.add(obj.name()).await,
                    Some(WatchEvent::Error(message)) => {
                        warn!(kind = K::KIND, error = %message, "Watch failed, restarting");
                        break;
                    }
                    None => break,
                },
            }
        }
    }
}

async fn worker_loop<K: Resource>(
    id: usize,
    api: Api<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = queue.get() => key,
        };

        let obj = match api.get_opt(&key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                queue.forget(&key).await;
                queue.done(&key).await;
                continue;
            }
            Err(e) => {
                warn!(kind = K::KIND, name = %key, error = %e, "Failed to load object");
                queue.add_rate_limited(&key).await;
                queue.done(&key).await;
                continue;
            }
        };

        match reconciler.reconcile(obj, &cancel).await {
            Ok(Action::Done) => queue.forget(&key).await,
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key).await;
                queue.add_after(&key, delay);
            }
            Err(e) if e.is_cancelled() && cancel.is_cancelled() => {
                queue.done(&key).await;
                break;
            }
            Err(e) => {
                let delay = queue.add_rate_limited(&key).await;
                warn!(kind = K::KIND, name = %key, error = %e, ?delay, "Reconcile failed");
            }
        }
        queue.done(&key).await;
    }
    debug!(kind = K::KIND, worker = id, "Worker stopped");
}
