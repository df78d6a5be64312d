//! Thread workspaces: per-thread file areas that sync tools read and write.
//!
//! A workspace is identified by an opaque id. `DirWorkspace` keeps each one
//! as a directory under a root path; `MemoryWorkspace` keeps files in memory
//! for tests.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::WorkspaceError;

/// Workspace provisioning and file access.
#[async_trait]
pub trait WorkspaceFiles: Send + Sync {
    /// Provision a new empty workspace and return its id.
    async fn create_workspace(&self) -> Result<String, WorkspaceError>;

    /// Remove a workspace and everything in it. Missing workspaces are ignored.
    async fn delete_workspace(&self, id: &str) -> Result<(), WorkspaceError>;

    /// Read a file, or `None` if it does not exist.
    async fn read(&self, id: &str, path: &str) -> Result<Option<String>, WorkspaceError>;

    /// Write (overwrite) a file, creating parent directories.
    async fn write(&self, id: &str, path: &str, content: &str) -> Result<(), WorkspaceError>;

    /// Directory backing the workspace, if it lives on disk.
    fn local_dir(&self, _id: &str) -> Option<PathBuf> {
        None
    }
}

/// Reject absolute paths and parent traversal.
fn validate_relative(path: &str) -> Result<&Path, WorkspaceError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p)
    } else {
        Err(WorkspaceError::InvalidPath(path.to_string()))
    }
}

fn validate_id(id: &str) -> Result<(), WorkspaceError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidPath(id.to_string()))
    }
}

// ── On-disk workspaces ──────────────────────────────────────────────

/// Workspaces stored as directories under `root`.
pub struct DirWorkspace {
    root: PathBuf,
}

impl DirWorkspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a workspace-relative path to an absolute path.
    fn resolve_path(&self, id: &str, relative: &str) -> Result<PathBuf, WorkspaceError> {
        validate_id(id)?;
        let rel = validate_relative(relative)?;
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(WorkspaceError::NotFound { id: id.to_string() });
        }
        Ok(dir.join(rel))
    }
}

#[async_trait]
impl WorkspaceFiles for DirWorkspace {
    async fn create_workspace(&self) -> Result<String, WorkspaceError> {
        let id = format!("ws-{}", uuid::Uuid::new_v4().simple());
        fs::create_dir_all(self.root.join(&id)).await?;
        tracing::debug!(workspace = %id, "Workspace created");
        Ok(id)
    }

    async fn delete_workspace(&self, id: &str) -> Result<(), WorkspaceError> {
        validate_id(id)?;
        match fs::remove_dir_all(self.root.join(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, id: &str, path: &str) -> Result<Option<String>, WorkspaceError> {
        let full_path = self.resolve_path(id, path)?;
        match fs::read_to_string(&full_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &str, path: &str, content: &str) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(id, path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content).await?;
        Ok(())
    }

    fn local_dir(&self, id: &str) -> Option<PathBuf> {
        validate_id(id).ok()?;
        Some(self.root.join(id))
    }
}

// ── In-memory workspaces ────────────────────────────────────────────

/// Workspaces kept in process memory.
#[derive(Default)]
pub struct MemoryWorkspace {
    workspaces: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.workspaces.lock().await.contains_key(id)
    }
}

#[async_trait]
impl WorkspaceFiles for MemoryWorkspace {
    async fn create_workspace(&self) -> Result<String, WorkspaceError> {
        let id = format!("ws-{}", uuid::Uuid::new_v4().simple());
        self.workspaces
            .lock()
            .await
            .insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn delete_workspace(&self, id: &str) -> Result<(), WorkspaceError> {
        self.workspaces.lock().await.remove(id);
        Ok(())
    }

    async fn read(&self, id: &str, path: &str) -> Result<Option<String>, WorkspaceError> {
        validate_relative(path)?;
        let workspaces = self.workspaces.lock().await;
        let files = workspaces
            .get(id)
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?;
        Ok(files.get(path).cloned())
    }

    async fn write(&self, id: &str, path: &str, content: &str) -> Result<(), WorkspaceError> {
        validate_relative(path)?;
        let mut workspaces = self.workspaces.lock().await;
        let files = workspaces
            .get_mut(id)
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?;
        files.insert(path.to_string(), content.to_string());
        Ok(())
    }
}
