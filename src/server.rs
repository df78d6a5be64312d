//! HTTP surface: knowledge-source REST endpoints plus progress streams.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::model::{
    KnowledgeFile, KnowledgeSource, KnowledgeSourceManifest, SOURCE_NAME_FIELD,
};
use crate::progress::{ProgressState, progress_routes};
use crate::retry::retry_on_conflict;
use crate::store::{Api, FieldSelector};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sources: Api<KnowledgeSource>,
    pub files: Api<KnowledgeFile>,
    /// Retry policy for sync-generation bumps.
    pub retry: RetryPolicy,
}

/// Build the full application router.
pub fn router(state: AppState, progress: ProgressState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/knowledge-sources", post(create_source))
        .route(
            "/knowledge-sources/{name}",
            get(get_source).delete(delete_source),
        )
        .route("/knowledge-sources/{name}/sync", post(trigger_sync))
        .route("/knowledge-sources/{name}/files", get(list_files))
        .with_state(Arc::new(state))
        .merge(progress_routes(progress))
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "knowledge-sync"
    }))
}

// ── Knowledge sources ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSourceRequest {
    name: String,
    manifest: KnowledgeSourceManifest,
    #[serde(default)]
    sync_schedule: String,
    #[serde(default)]
    knowledge_set_name: String,
}

async fn create_source(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSourceRequest>,
) -> impl IntoResponse {
    if let Err(message) = validate_name(&req.name) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": message })));
    }
    if !req.sync_schedule.trim().is_empty()
        && let Err(e) = crate::knowledge::reschedule::parse_schedule(&req.sync_schedule)
    {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
    }

    let mut source = KnowledgeSource::new(state.sources.namespace(), &req.name, req.manifest)
        .with_schedule(req.sync_schedule);
    source.spec.knowledge_set_name = req.knowledge_set_name;

    match state.sources.create(&source).await {
        Ok(created) => {
            info!(source = %created.metadata.name, tool = created.spec.manifest.tool_reference(), "Knowledge source created");
            (StatusCode::CREATED, Json(json!(created)))
        }
        Err(e) => store_error(e),
    }
}

async fn get_source(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.sources.get(&name).await {
        Ok(source) => (StatusCode::OK, Json(json!(source))),
        Err(e) => store_error(e),
    }
}

async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.sources.delete(&name).await {
        Ok(()) => {
            info!(source = %name, "Knowledge source deletion requested");
            (StatusCode::ACCEPTED, Json(json!({ "deleted": name })))
        }
        Err(e) => store_error(e),
    }
}

/// Request a new sync by bumping the desired generation.
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let result = retry_on_conflict(&state.retry, || {
        let sources = state.sources.clone();
        let name = name.clone();
        async move {
            let mut source = sources.get(&name).await?;
            if source.metadata.is_deleting() {
                return Ok(source);
            }
            source.spec.sync_generation += 1;
            sources.update(&source).await
        }
    })
    .await;

    match result {
        Ok(source) if source.metadata.is_deleting() => (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("knowledge source {name} is being deleted") })),
        ),
        Ok(source) => {
            info!(source = %name, generation = source.spec.sync_generation, "Sync requested");
            (StatusCode::ACCEPTED, Json(json!(source)))
        }
        Err(e) => store_error(e),
    }
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.sources.get(&name).await {
        return store_error(e);
    }
    match state
        .files
        .list(FieldSelector::default().field(SOURCE_NAME_FIELD, name.as_str()))
        .await
    {
        Ok(mut files) => {
            files.sort_by(|a, b| a.spec.file_name.cmp(&b.spec.file_name));
            (StatusCode::OK, Json(json!(files)))
        }
        Err(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => StatusCode::CONFLICT,
        _ => {
            warn!(error = %e, "Store request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// Names become part of derived object names, so keep them DNS-label shaped.
fn validate_name(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(format!(
            "invalid name {name:?}: use 1-63 lowercase letters, digits or '-'"
        ))
    }
}
