use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use knowledge_sync::config::{ServerConfig, SyncConfig};
use knowledge_sync::controller::Controller;
use knowledge_sync::credentials::StaticCredentials;
use knowledge_sync::invoker::ProcessInvoker;
use knowledge_sync::knowledge::{KnowledgeSourceReconciler, SyncDeps};
use knowledge_sync::model::{KnowledgeFile, KnowledgeSource, Thread};
use knowledge_sync::progress::{ProgressHub, ProgressState};
use knowledge_sync::server::{AppState, router};
use knowledge_sync::store::{Api, LibSqlStore, ObjectStore};
use knowledge_sync::threads::ThreadReconciler;
use knowledge_sync::workspace::{DirWorkspace, WorkspaceFiles};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid server configuration")?;
    let sync_config = SyncConfig::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "knowledge-sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        )
        .with(file_layer.with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        ))
        .init();

    eprintln!("📚 Knowledge Sync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Namespace: {}", config.namespace);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workspaces: {}", config.workspace_root.display());
    eprintln!("   API: http://0.0.0.0:{}/knowledge-sources", config.port);

    // ── Store ────────────────────────────────────────────────────────────
    let store: Arc<dyn ObjectStore> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let sources: Api<KnowledgeSource> = Api::namespaced(Arc::clone(&store), &config.namespace);
    let threads: Api<Thread> = sources.with_kind();
    let files: Api<KnowledgeFile> = sources.with_kind();

    // ── Collaborators ────────────────────────────────────────────────────
    let workspace: Arc<dyn WorkspaceFiles> =
        Arc::new(DirWorkspace::new(config.workspace_root.clone()));
    if config.tool_commands.is_empty() {
        tracing::warn!("No KSYNC_TOOL_* commands configured; syncs will fail to start");
    }
    let invoker = Arc::new(ProcessInvoker::new(
        Arc::clone(&workspace),
        config.tool_commands.clone(),
    ));
    let credentials = Arc::new(StaticCredentials::from_env(&config.namespace));
    let hub = Arc::new(ProgressHub::new());

    // ── Controllers ──────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let deps = SyncDeps {
        sources: sources.clone(),
        threads: threads.clone(),
        files: files.clone(),
        invoker,
        workspace: Arc::clone(&workspace),
        credentials,
        hub: Arc::clone(&hub),
    };
    let source_controller = Controller::new(
        sources.clone(),
        Arc::new(KnowledgeSourceReconciler::new(deps, sync_config.clone())),
        config.workers,
        config.resync_interval,
    );
    let thread_controller = Controller::new(
        threads.clone(),
        Arc::new(ThreadReconciler::new(threads, Arc::clone(&workspace))),
        config.workers,
        config.resync_interval,
    );
    let source_task = tokio::spawn(source_controller.run(cancel.clone()));
    let thread_task = tokio::spawn(thread_controller.run(cancel.clone()));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = router(
        AppState {
            sources,
            files,
            retry: sync_config.status_retry,
        },
        ProgressState::new(hub, config.heartbeat_interval),
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutting down");
        shutdown.cancel();
    });

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    let _ = tokio::join!(source_task, thread_task);
    Ok(())
}
