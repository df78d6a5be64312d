//! Thread objects: the execution context a sync task runs in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::knowledge::SOURCE_NAME_FIELD;
use super::meta::{HasStatus, ObjectMeta, Resource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ThreadSpec,
    #[serde(default)]
    pub status: ThreadStatus,
}

impl Thread {
    /// A thread owned by the named knowledge source.
    pub fn for_source(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: ThreadSpec {
                knowledge_source_name: source_name.into(),
                system_task: true,
            },
            status: ThreadStatus::default(),
        }
    }

    pub fn workspace_ready(&self) -> bool {
        !self.status.workspace_id.is_empty()
    }
}

impl Resource for Thread {
    const KIND: &'static str = "Thread";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn selectable_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            SOURCE_NAME_FIELD.to_string(),
            self.spec.knowledge_source_name.clone(),
        )])
    }
}

impl HasStatus for Thread {
    type Status = ThreadStatus;

    fn status(&self) -> &ThreadStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ThreadStatus {
        &mut self.status
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub knowledge_source_name: String,
    /// Created by the system rather than a user conversation.
    #[serde(default)]
    pub system_task: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStatus {
    #[serde(rename = "workspaceID", default, skip_serializing_if = "String::is_empty")]
    pub workspace_id: String,
}
