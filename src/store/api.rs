//! Typed access to the object store.

use std::marker::PhantomData;
use std::sync::Arc;

use super::traits::{FieldSelector, ObjectStore, RawObject, RawWatchEvent, WatchReceiver};
use crate::error::StoreError;
use crate::model::Resource;

/// A namespaced handle for one resource kind.
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn namespaced(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            _kind: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The same store, viewed as another kind.
    pub fn with_kind<T: Resource>(&self) -> Api<T> {
        Api::namespaced(Arc::clone(&self.store), self.namespace.clone())
    }

    /// Load an object. Fails with `NotFound` if absent.
    pub async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.get_opt(name)
            .await?
            .ok_or_else(|| StoreError::not_found(K::KIND, name))
    }

    pub async fn get_opt(&self, name: &str) -> Result<Option<K>, StoreError> {
        match self.store.get(K::KIND, &self.namespace, name).await? {
            Some(raw) => Ok(Some(from_raw(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let raw = self.to_raw(obj)?;
        from_raw(self.store.create(raw).await?)
    }

    /// Write `obj` back. Conflicts if its resource version is stale.
    pub async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let raw = self.to_raw(obj)?;
        from_raw(self.store.update(raw).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete(K::KIND, &self.namespace, name).await
    }

    /// List objects in this namespace matching `selector`.
    pub async fn list(&self, selector: FieldSelector) -> Result<Vec<K>, StoreError> {
        let selector = selector.namespace(self.namespace.clone());
        self.store
            .list(K::KIND, &selector)
            .await?
            .into_iter()
            .map(from_raw)
            .collect()
    }

    pub async fn list_all(&self) -> Result<Vec<K>, StoreError> {
        self.list(FieldSelector::default()).await
    }

    /// Watch objects in this namespace matching `selector`.
    pub async fn watch(&self, selector: FieldSelector) -> Result<WatchStream<K>, StoreError> {
        let selector = selector.namespace(self.namespace.clone());
        let rx = self.store.watch(K::KIND, &selector).await?;
        Ok(WatchStream {
            rx,
            _kind: PhantomData,
        })
    }

    fn to_raw(&self, obj: &K) -> Result<RawObject, StoreError> {
        let mut metadata = obj.meta().clone();
        if metadata.namespace.is_empty() {
            metadata.namespace = self.namespace.clone();
        }
        Ok(RawObject {
            kind: K::KIND.to_string(),
            metadata,
            fields: obj.selectable_fields(),
            body: serde_json::to_value(obj)?,
        })
    }
}

/// Decode a stored object, trusting the store's metadata over the body's.
fn from_raw<K: Resource>(raw: RawObject) -> Result<K, StoreError> {
    let mut body = raw.body;
    if let serde_json::Value::Object(map) = &mut body {
        map.insert("metadata".to_string(), serde_json::to_value(&raw.metadata)?);
    }
    Ok(serde_json::from_value(body)?)
}

/// A typed change notification.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Error(String),
}

/// Typed receiving end of a watch.
pub struct WatchStream<K> {
    rx: WatchReceiver,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> WatchStream<K> {
    /// Next event, or `None` once the watch has closed.
    ///
    /// Objects that fail to decode surface as `Error` events.
    pub async fn next(&mut self) -> Option<WatchEvent<K>> {
        let event = self.rx.recv().await?;
        let typed = match event {
            RawWatchEvent::Added(raw) => from_raw(raw).map(WatchEvent::Added),
            RawWatchEvent::Modified(raw) => from_raw(raw).map(WatchEvent::Modified),
            RawWatchEvent::Deleted(raw) => from_raw(raw).map(WatchEvent::Deleted),
            RawWatchEvent::Error(message) => Ok(WatchEvent::Error(message)),
        };
        Some(typed.unwrap_or_else(|e| WatchEvent::Error(e.to_string())))
    }
}
