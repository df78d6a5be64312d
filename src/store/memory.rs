//! In-memory `ObjectStore`: used by tests and embedded setups.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::{
    FieldSelector, ObjectStore, RawObject, RawWatchEvent, WatchReceiver, WriteOutcome,
    prepare_create, prepare_delete, prepare_update,
};
use super::watch::WatchHub;
use crate::error::StoreError;

type Key = (String, String, String);

fn key(kind: &str, namespace: &str, name: &str) -> Key {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

/// Object store kept entirely in process memory.
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, RawObject>>,
    hub: WatchHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            hub: WatchHub::new(),
        }
    }

    /// Number of stored objects of `kind` (test helper).
    pub async fn count(&self, kind: &str) -> usize {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError> {
        Ok(self
            .objects
            .lock()
            .await
            .get(&key(kind, namespace, name))
            .cloned())
    }

    async fn create(&self, obj: RawObject) -> Result<RawObject, StoreError> {
        let mut objects = self.objects.lock().await;
        let k = key(&obj.kind, &obj.metadata.namespace, &obj.metadata.name);
        if objects.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: obj.kind,
                name: obj.metadata.name,
            });
        }
        let obj = prepare_create(obj);
        objects.insert(k, obj.clone());
        self.hub.publish(RawWatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: RawObject) -> Result<RawObject, StoreError> {
        let mut objects = self.objects.lock().await;
        let k = key(&obj.kind, &obj.metadata.namespace, &obj.metadata.name);
        let current = objects
            .get(&k)
            .ok_or_else(|| StoreError::not_found(&obj.kind, &obj.metadata.name))?;

        match prepare_update(current, obj)? {
            WriteOutcome::Stored(obj) => {
                objects.insert(k, obj.clone());
                self.hub.publish(RawWatchEvent::Modified(obj.clone()));
                Ok(obj)
            }
            WriteOutcome::Removed(obj) => {
                objects.remove(&k);
                self.hub.publish(RawWatchEvent::Deleted(obj.clone()));
                Ok(obj)
            }
        }
    }

    async fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        let k = key(kind, namespace, name);
        let current = objects
            .get(&k)
            .ok_or_else(|| StoreError::not_found(kind, name))?;

        match prepare_delete(current) {
            WriteOutcome::Stored(obj) => {
                if obj.metadata.resource_version != current.metadata.resource_version {
                    objects.insert(k, obj.clone());
                    self.hub.publish(RawWatchEvent::Modified(obj));
                }
            }
            WriteOutcome::Removed(obj) => {
                objects.remove(&k);
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
        Ok(self
            .objects
            .lock()
            .await
            .values()
            .filter(|obj| obj.kind == kind && selector.matches(obj))
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        kind: &str,
        selector: &FieldSelector,
    ) -> Result<WatchReceiver, StoreError> {
        Ok(self.hub.watch(kind, selector))
    }
}
