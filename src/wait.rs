//! Condition-gated fetch: load (or create) an object, then block on a watch
//! until a predicate holds.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;
use crate::model::Resource;
use crate::store::{Api, FieldSelector, WatchEvent};

/// Default time to wait for a condition.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Return `name` once `predicate` holds for it.
///
/// When the object is absent and `create` is given, it is created first.
/// No watch is opened if the predicate already holds. Fails with
/// `NotFound` if the object is deleted while waiting, `Timeout` when
/// `timeout` elapses, and `Cancelled` when `cancel` fires.
pub async fn wait_for<K, F>(
    api: &Api<K>,
    name: &str,
    create: Option<K>,
    timeout: Duration,
    cancel: &CancellationToken,
    predicate: F,
) -> Result<K, StoreError>
where
    K: Resource,
    F: Fn(&K) -> bool,
{
    let current = match api.get_opt(name).await? {
        Some(obj) => obj,
        None => match create {
            Some(obj) => create_or_get(api, name, obj).await?,
            None => return Err(StoreError::not_found(K::KIND, name)),
        },
    };
    if predicate(&current) {
        return Ok(current);
    }

    let mut watch = api.watch(FieldSelector::default().name(name)).await?;

    // The object may have changed between the load and the watch opening.
    match api.get_opt(name).await? {
        Some(obj) if predicate(&obj) => return Ok(obj),
        Some(_) => {}
        None => return Err(StoreError::not_found(K::KIND, name)),
    }

    debug!(kind = K::KIND, name, ?timeout, "Waiting for condition");
    let deadline = Instant::now() + timeout;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(StoreError::Timeout {
                    kind: K::KIND.to_string(),
                    name: name.to_string(),
                    timeout,
                });
            }
            event = watch.next() => event,
        };

        match event {
            Some(WatchEvent::Added(obj)) | Some(WatchEvent::Modified(obj)) => {
                if predicate(&obj) {
                    return Ok(obj);
                }
            }
            Some(WatchEvent::Deleted(_)) => return Err(StoreError::not_found(K::KIND, name)),
            Some(WatchEvent::Error(message)) => return Err(StoreError::Watch(message)),
            None => return Err(StoreError::Watch("watch closed".to_string())),
        }
    }
}

async fn create_or_get<K: Resource>(api: &Api<K>, name: &str, obj: K) -> Result<K, StoreError> {
    match api.create(&obj).await {
        Ok(_) => api.get(name).await,
        // Lost a race with another creator.
        Err(StoreError::AlreadyExists { .. }) => api.get(name).await,
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Thread;
    use crate::store::{MemoryStore, ObjectStore};

    fn api() -> Api<Thread> {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        Api::namespaced(store, "default")
    }

    #[tokio::test]
    async fn returns_immediately_when_ready() {
        let api = api();
        let mut thread = Thread::for_source("default", "ks-docs", "docs");
        thread.status.workspace_id = "ws-1".into();
        api.create(&thread).await.unwrap();

        let cancel = CancellationToken::new();
        let got = wait_for(&api, "ks-docs", None, Duration::from_millis(10), &cancel, |t| {
            t.workspace_ready()
        })
        .await
        .unwrap();
        assert_eq!(got.status.workspace_id, "ws-1");
    }

    #[tokio::test]
    async fn missing_without_create_is_not_found() {
        let api = api();
        let cancel = CancellationToken::new();
        let err = wait_for(&api, "ghost", None, Duration::from_secs(1), &cancel, |_| true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn creates_then_wakes_on_update() {
        let api = api();
        let cancel = CancellationToken::new();

        let waiter = {
            let api = api.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_for(
                    &api,
                    "ks-docs",
                    Some(Thread::for_source("default", "ks-docs", "docs")),
                    Duration::from_secs(5),
                    &cancel,
                    |t| t.workspace_ready(),
                )
                .await
            })
        };

        // Wait until the waiter has created the thread, then provision it.
        let mut thread = loop {
            if let Some(t) = api.get_opt("ks-docs").await.unwrap() {
                break t;
            }
            tokio::task::yield_now().await;
        };
        thread.status.workspace_id = "ws-9".into();
        api.update(&thread).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.status.workspace_id, "ws-9");
    }

    #[tokio::test]
    async fn times_out() {
        let api = api();
        api.create(&Thread::for_source("default", "ks-docs", "docs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let err = wait_for(&api, "ks-docs", None, Duration::from_millis(50), &cancel, |t| {
            t.workspace_ready()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn deletion_while_waiting_is_not_found() {
        let api = api();
        api.create(&Thread::for_source("default", "ks-docs", "docs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let api = api.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_for(&api, "ks-docs", None, Duration::from_secs(5), &cancel, |t| {
                    t.workspace_ready()
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        api.delete("ks-docs").await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let api = api();
        api.create(&Thread::for_source("default", "ks-docs", "docs"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for(&api, "ks-docs", None, Duration::from_secs(60), &cancel, |t| {
            t.workspace_ready()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
