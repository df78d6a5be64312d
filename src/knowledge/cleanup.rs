//! Deletion of a knowledge source's derived objects.

use tracing::{debug, info};

use super::FINALIZER;
use super::sync::SyncDeps;
use crate::config::SyncConfig;
use crate::controller::Action;
use crate::error::Error;
use crate::model::{KnowledgeSource, SOURCE_NAME_FIELD};
use crate::retry::retry_on_conflict;
use crate::store::FieldSelector;

/// Tear down what `source` owns, then release its finalizer.
///
/// Files go first. While any remain the source is requeued, so the thread
/// and the finalizer are only dropped once every file is gone.
pub async fn cleanup(
    deps: &SyncDeps,
    config: &SyncConfig,
    source: &KnowledgeSource,
) -> Result<Action, Error> {
    let name = source.metadata.name.as_str();
    let files = deps
        .files
        .list(FieldSelector::default().field(SOURCE_NAME_FIELD, name))
        .await?;

    if !files.is_empty() {
        debug!(source = %name, remaining = files.len(), "Deleting knowledge files");
        for file in files.iter().filter(|f| !f.metadata.is_deleting()) {
            match deps.files.delete(&file.metadata.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        return Ok(Action::RequeueAfter(config.cleanup_requeue));
    }

    match deps.threads.delete(&source.thread_name()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    if source.metadata.has_finalizer(FINALIZER) {
        let sources = &deps.sources;
        retry_on_conflict(&config.status_retry, || async move {
            let Some(mut current) = sources.get_opt(name).await? else {
                return Ok(());
            };
            if current.metadata.remove_finalizer(FINALIZER) {
                sources.update(&current).await?;
            }
            Ok(())
        })
        .await?;
    }
    info!(source = %name, "Knowledge source cleaned up");
    Ok(Action::Done)
}
