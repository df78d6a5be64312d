//! Knowledge source and knowledge file objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::{HasStatus, ObjectMeta, Resource};

/// Field selector key linking derived objects to their knowledge source.
pub const SOURCE_NAME_FIELD: &str = "spec.knowledgeSourceName";

// ── Knowledge source ────────────────────────────────────────────────

/// A configured external data origin that periodically syncs documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub metadata: ObjectMeta,
    pub spec: KnowledgeSourceSpec,
    #[serde(default)]
    pub status: KnowledgeSourceStatus,
}

impl KnowledgeSource {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        manifest: KnowledgeSourceManifest,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: KnowledgeSourceSpec {
                knowledge_set_name: String::new(),
                sync_generation: 1,
                manifest,
                sync_schedule: String::new(),
            },
            status: KnowledgeSourceStatus::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.spec.sync_schedule = schedule.into();
        self
    }

    /// The desired generation has been observed and settled.
    pub fn is_settled(&self) -> bool {
        self.status.sync_state.is_terminal()
            && self.status.sync_generation == self.spec.sync_generation
    }

    /// Deterministic name of the backing thread.
    pub fn thread_name(&self) -> String {
        format!("ks-{}", self.metadata.name)
    }
}

impl Resource for KnowledgeSource {
    const KIND: &'static str = "KnowledgeSource";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasStatus for KnowledgeSource {
    type Status = KnowledgeSourceStatus;

    fn status(&self) -> &KnowledgeSourceStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut KnowledgeSourceStatus {
        &mut self.status
    }
}

/// Desired state of a knowledge source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSourceSpec {
    #[serde(default)]
    pub knowledge_set_name: String,
    /// Bumped to request a new sync.
    #[serde(default)]
    pub sync_generation: i64,
    pub manifest: KnowledgeSourceManifest,
    /// Five-field cron expression; empty disables recurring syncs.
    #[serde(default)]
    pub sync_schedule: String,
}

/// Provider-specific sync input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnowledgeSourceManifest {
    Website {
        #[serde(rename = "siteURLs", default)]
        site_urls: Vec<String>,
    },
    #[serde(rename = "onedrive")]
    OneDrive {
        #[serde(rename = "sharedLinks", default)]
        shared_links: Vec<String>,
    },
    Notion {},
}

impl KnowledgeSourceManifest {
    /// The data-source tool that performs the sync.
    pub fn tool_reference(&self) -> &'static str {
        match self {
            Self::Website { .. } => "website-data-source",
            Self::OneDrive { .. } => "onedrive-data-source",
            Self::Notion {} => "notion-data-source",
        }
    }

    /// Credential that must be authorized before the tool can run.
    pub fn required_credential(&self) -> Option<&'static str> {
        match self {
            Self::Website { .. } => None,
            Self::OneDrive { .. } => Some("onedrive"),
            Self::Notion {} => Some("notion"),
        }
    }
}

/// Lifecycle state of a knowledge source sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnowledgeSourceState {
    #[default]
    #[serde(alias = "")]
    Pending,
    Syncing,
    Synced,
    Error,
}

impl KnowledgeSourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Error)
    }
}

impl std::fmt::Display for KnowledgeSourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Observed state of a knowledge source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSourceStatus {
    #[serde(default)]
    pub sync_state: KnowledgeSourceState,
    /// Generation the current state refers to.
    #[serde(default)]
    pub sync_generation: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Gzip-compressed provider state, opaque to the controller.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub sync_details: Vec<u8>,
    /// Free-text progress reported by the provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sync_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_name: String,
    #[serde(rename = "workspaceID", default, skip_serializing_if = "String::is_empty")]
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_name: String,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ── Knowledge file ──────────────────────────────────────────────────

/// One document discovered by a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub metadata: ObjectMeta,
    pub spec: KnowledgeFileSpec,
}

impl Resource for KnowledgeFile {
    const KIND: &'static str = "KnowledgeFile";

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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeFileSpec {
    pub knowledge_source_name: String,
    #[serde(default)]
    pub knowledge_set_name: String,
    /// Provider-assigned file identifier.
    #[serde(rename = "fileID", default)]
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub size_in_bytes: i64,
}
