//! libSQL backend: durable `ObjectStore` implementation.
//!
//! Objects live in a single `objects` table keyed by (kind, namespace, name).
//! Updates are compare-and-swap on `resource_version`. Watches are served
//! in-process from the same fan-out the memory store uses.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::info;

use super::migrations;
use super::traits::{
    FieldSelector, ObjectStore, RawObject, RawWatchEvent, WatchReceiver, WriteOutcome,
    prepare_create, prepare_delete, prepare_update,
};
use super::watch::WatchHub;
use crate::error::StoreError;
use crate::model::ObjectMeta;

/// libSQL object store.
///
/// Writes are serialized through `write_lock` so that watch events are
/// published in commit order.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
    hub: WatchHub,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Object store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Backend(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
            hub: WatchHub::new(),
        })
    }

    async fn fetch(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3"
                ),
                params![kind, namespace, name],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_object(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("get: {e}"))),
        }
    }

    async fn insert_row(&self, obj: &RawObject) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO objects (kind, namespace, name, resource_version, metadata, fields, body, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    obj.kind.clone(),
                    obj.metadata.namespace.clone(),
                    obj.metadata.name.clone(),
                    obj.metadata.resource_version as i64,
                    serde_json::to_string(&obj.metadata)?,
                    serde_json::to_string(&obj.fields)?,
                    obj.body.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("create: {e}")))?;
        Ok(())
    }

    /// Compare-and-swap write. Returns `false` if the stored version moved.
    async fn swap_row(&self, obj: &RawObject, expected_version: u64) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE objects SET resource_version = ?1, metadata = ?2, fields = ?3, body = ?4, updated_at = ?5 WHERE kind = ?6 AND namespace = ?7 AND name = ?8 AND resource_version = ?9",
                params![
                    obj.metadata.resource_version as i64,
                    serde_json::to_string(&obj.metadata)?,
                    serde_json::to_string(&obj.fields)?,
                    obj.body.to_string(),
                    Utc::now().to_rfc3339(),
                    obj.kind.clone(),
                    obj.metadata.namespace.clone(),
                    obj.metadata.name.clone(),
                    expected_version as i64,
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("update: {e}")))?;
        Ok(changed == 1)
    }

    async fn delete_row(&self, obj: &RawObject) -> Result<(), StoreError> {
        self.conn
            .execute(
                "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![
                    obj.kind.clone(),
                    obj.metadata.namespace.clone(),
                    obj.metadata.name.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("delete: {e}")))?;
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const OBJECT_COLUMNS: &str = "kind, metadata, fields, body";

fn row_to_object(row: &libsql::Row) -> Result<RawObject, StoreError> {
    let read = |idx: i32| -> Result<String, StoreError> {
        row.get::<String>(idx)
            .map_err(|e| StoreError::Backend(format!("row column {idx}: {e}")))
    };

    let kind = read(0)?;
    let metadata: ObjectMeta = serde_json::from_str(&read(1)?)?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&read(2)?)?;
    let body: serde_json::Value = serde_json::from_str(&read(3)?)?;

    Ok(RawObject {
        kind,
        metadata,
        fields,
        body,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ObjectStore for LibSqlStore {
    async fn get(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError> {
        self.fetch(kind, namespace, name).await
    }

    async fn create(&self, obj: RawObject) -> Result<RawObject, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self
            .fetch(&obj.kind, &obj.metadata.namespace, &obj.metadata.name)
            .await?
            .is_some()
        {
            return Err(StoreError::AlreadyExists {
                kind: obj.kind,
                name: obj.metadata.name,
            });
        }

        let obj = prepare_create(obj);
        self.insert_row(&obj).await?;
        self.hub.publish(RawWatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: RawObject) -> Result<RawObject, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .fetch(&obj.kind, &obj.metadata.namespace, &obj.metadata.name)
            .await?
            .ok_or_else(|| StoreError::not_found(&obj.kind, &obj.metadata.name))?;

        let expected = current.metadata.resource_version;
        match prepare_update(&current, obj)? {
            WriteOutcome::Stored(obj) => {
                if !self.swap_row(&obj, expected).await? {
                    return Err(StoreError::conflict(&obj.kind, &obj.metadata.name));
                }
                self.hub.publish(RawWatchEvent::Modified(obj.clone()));
                Ok(obj)
            }
            WriteOutcome::Removed(obj) => {
                self.delete_row(&obj).await?;
                self.hub.publish(RawWatchEvent::Deleted(obj.clone()));
                Ok(obj)
            }
        }
    }

    async fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .fetch(kind, namespace, name)
            .await?
            .ok_or_else(|| StoreError::not_found(kind, name))?;

        match prepare_delete(&current) {
            WriteOutcome::Stored(obj) => {
                if obj.metadata.resource_version != current.metadata.resource_version {
                    if !self
                        .swap_row(&obj, current.metadata.resource_version)
                        .await?
                    {
                        return Err(StoreError::conflict(kind, name));
                    }
                    self.hub.publish(RawWatchEvent::Modified(obj));
                }
            }
            WriteOutcome::Removed(obj) => {
                self.delete_row(&obj).await?;
                self.hub.publish(RawWatchEvent::Deleted(obj));
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: &str,
        selector: &FieldSelector,
    ) -> Result<Vec<RawObject>, StoreError> {
        let mut rows = match &selector.namespace {
            Some(ns) => self
                .conn
                .query(
                    &format!(
                        "SELECT {OBJECT_COLUMNS} FROM objects WHERE kind = ?1 AND namespace = ?2 ORDER BY name"
                    ),
                    params![kind, ns.as_str()],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE kind = ?1 ORDER BY namespace, name"),
                    params![kind],
                )
                .await,
        }
        .map_err(|e| StoreError::Backend(format!("list: {e}")))?;

        let mut objects = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_object(&row) {
                Ok(obj) if selector.matches(&obj) => objects.push(obj),
                Ok(_) => {}
                Err(e) => tracing::warn!(kind, "Skipping object row: {e}"),
            }
        }
        Ok(objects)
    }

    async fn watch(
        &self,
        kind: &str,
        selector: &FieldSelector,
    ) -> Result<WatchReceiver, StoreError> {
        Ok(self.hub.watch(kind, selector))
    }
}
