//! Conflict-safe writes.
//!
//! Status writes race with writers of the same object's spec and metadata.
//! On a conflict the object is re-fetched, the intended status is restored
//! onto the fresh copy, and the write is retried within a bounded budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::model::HasStatus;
use crate::store::Api;

/// Persist `obj`'s status, retrying on conflicts.
///
/// Only the status is owned by the caller: every retry starts from the
/// latest stored object and overlays the status snapshot taken on entry.
/// After `policy.attempts` conflicts the last conflict is returned.
pub async fn update_status_with_retry<K: HasStatus>(
    api: &Api<K>,
    obj: &K,
    policy: &RetryPolicy,
) -> Result<K, StoreError> {
    let intended = obj.status().clone();
    let name = obj.name().to_string();
    let mut candidate = obj.clone();
    let mut attempt = 1;

    loop {
        match api.update(&candidate).await {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!(kind = K::KIND, name = %name, attempt, "Status write conflicted, retrying");
                tokio::time::sleep(retry_delay(policy)).await;
                candidate = api.get(&name).await?;
                *candidate.status_mut() = intended.clone();
                attempt += 1;
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(kind = K::KIND, name = %name, attempts = attempt, "Status write retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Run `op` until it succeeds or fails with something other than a conflict.
///
/// `op` must re-read whatever it writes, since each call follows a lost race.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!(attempt, "Write conflicted, retrying");
                tokio::time::sleep(retry_delay(policy)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Fixed delay plus optional uniform jitter on top.
fn retry_delay(policy: &RetryPolicy) -> Duration {
    let jitter_ms = policy.jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return policy.delay;
    }
    policy.delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
