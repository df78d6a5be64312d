//! Backend-agnostic `ObjectStore` trait: versioned objects with watch semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::model::ObjectMeta;

/// An untyped stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Selectable field values, computed by the typed layer on write.
    pub fields: BTreeMap<String, String>,
    /// Full serialized object.
    pub body: serde_json::Value,
}

/// Scopes list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl FieldSelector {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, obj: &RawObject) -> bool {
        if let Some(ns) = &self.namespace
            && *ns != obj.metadata.namespace
        {
            return false;
        }
        if let Some(name) = &self.name
            && *name != obj.metadata.name
        {
            return false;
        }
        self.fields
            .iter()
            .all(|(k, v)| obj.fields.get(k).is_some_and(|actual| actual == v))
    }
}

/// A change notification for one object.
#[derive(Debug, Clone)]
pub enum RawWatchEvent {
    Added(RawObject),
    Modified(RawObject),
    Deleted(RawObject),
    Error(String),
}

impl RawWatchEvent {
    pub fn object(&self) -> Option<&RawObject> {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => Some(o),
            Self::Error(_) => None,
        }
    }
}

/// Receiving end of a watch. Dropping it ends the watch.
pub type WatchReceiver = mpsc::Receiver<RawWatchEvent>;

/// Versioned object store with optimistic concurrency and watches.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Load one object, or `None` if absent.
    async fn get(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError>;

    /// Create a new object. Fails with `AlreadyExists`.
    async fn create(&self, obj: RawObject) -> Result<RawObject, StoreError>;

    /// Replace an object. Fails with `Conflict` if the stored
    /// `resource_version` differs from the one supplied.
    async fn update(&self, obj: RawObject) -> Result<RawObject, StoreError>;

    /// Delete an object, or mark it deleting while finalizers remain.
    async fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list(&self, kind: &str, selector: &FieldSelector)
    -> Result<Vec<RawObject>, StoreError>;

    /// Subscribe to changes of `kind` matching `selector`.
    async fn watch(&self, kind: &str, selector: &FieldSelector)
    -> Result<WatchReceiver, StoreError>;
}

// ── Shared write semantics ──────────────────────────────────────────

/// Outcome of applying a write to the currently stored object.
pub(crate) enum WriteOutcome {
    Stored(RawObject),
    Removed(RawObject),
}

/// Stamp server-managed metadata on a new object.
pub(crate) fn prepare_create(mut obj: RawObject) -> RawObject {
    obj.metadata.uid = uuid::Uuid::new_v4().to_string();
    obj.metadata.resource_version = 1;
    obj.metadata.creation_timestamp = Some(Utc::now());
    obj.metadata.deletion_timestamp = None;
    sync_body_metadata(&mut obj);
    obj
}

/// Validate an update against the stored object and compute the result.
pub(crate) fn prepare_update(
    current: &RawObject,
    mut obj: RawObject,
) -> Result<WriteOutcome, StoreError> {
    if current.metadata.resource_version != obj.metadata.resource_version {
        return Err(StoreError::conflict(&obj.kind, &obj.metadata.name));
    }
    obj.metadata.uid = current.metadata.uid.clone();
    obj.metadata.creation_timestamp = current.metadata.creation_timestamp;
    obj.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
    obj.metadata.resource_version = current.metadata.resource_version + 1;
    sync_body_metadata(&mut obj);

    if obj.metadata.is_deleting() && obj.metadata.finalizers.is_empty() {
        Ok(WriteOutcome::Removed(obj))
    } else {
        Ok(WriteOutcome::Stored(obj))
    }
}

/// Compute the result of a delete request.
pub(crate) fn prepare_delete(current: &RawObject) -> WriteOutcome {
    if current.metadata.finalizers.is_empty() {
        return WriteOutcome::Removed(current.clone());
    }
    let mut obj = current.clone();
    if obj.metadata.deletion_timestamp.is_none() {
        obj.metadata.deletion_timestamp = Some(Utc::now());
        obj.metadata.resource_version += 1;
        sync_body_metadata(&mut obj);
    }
    WriteOutcome::Stored(obj)
}

/// Keep the serialized body's `metadata` in step with the store's copy.
pub(crate) fn sync_body_metadata(obj: &mut RawObject) {
    if let (serde_json::Value::Object(map), Ok(meta)) =
        (&mut obj.body, serde_json::to_value(&obj.metadata))
    {
        map.insert("metadata".to_string(), meta);
    }
}
