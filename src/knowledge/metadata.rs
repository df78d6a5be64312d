//! Sync metadata exchanged with the data-source tool through the workspace.
//!
//! Before a run the controller writes `{input, output: {state}}`. The tool
//! rewrites the file as it goes, reporting discovered files, a free-text
//! status, an optional error, and opaque state to hand to the next run.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetadataError, StoreError};
use crate::model::{
    KnowledgeFile, KnowledgeFileSpec, KnowledgeSource, KnowledgeSourceManifest, ObjectMeta,
    SOURCE_NAME_FIELD,
};
use crate::store::{Api, FieldSelector};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: SyncOutput,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOutput {
    /// Discovered files keyed by provider file id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileDetails>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetails {
    #[serde(rename = "fileID", default)]
    pub file_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size_in_bytes: i64,
}

/// Metadata handed to the tool at the start of a run.
pub fn initial_metadata(
    manifest: &KnowledgeSourceManifest,
    previous_details: &[u8],
) -> Result<String, MetadataError> {
    let metadata = SyncMetadata {
        input: serde_json::to_value(manifest).map_err(|e| MetadataError::Parse(e.to_string()))?,
        output: SyncOutput {
            state: decompress_state(previous_details)?,
            ..Default::default()
        },
    };
    serde_json::to_string(&metadata).map_err(|e| MetadataError::Parse(e.to_string()))
}

pub fn parse(content: &str) -> Result<SyncMetadata, MetadataError> {
    serde_json::from_str(content).map_err(|e| MetadataError::Parse(e.to_string()))
}

/// Gzip the provider state. Null state compresses to nothing.
pub fn compress_state(state: &serde_json::Value) -> Result<Vec<u8>, MetadataError> {
    if state.is_null() {
        return Ok(Vec::new());
    }
    let json = serde_json::to_vec(state).map_err(|e| MetadataError::Parse(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decompress_state(details: &[u8]) -> Result<serde_json::Value, MetadataError> {
    if details.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    let mut json = Vec::new();
    GzDecoder::new(details).read_to_end(&mut json)?;
    serde_json::from_slice(&json).map_err(|e| MetadataError::Parse(e.to_string()))
}

/// Deterministic object name for a file of a source.
pub fn file_object_name(source_name: &str, file_id: &str) -> String {
    let key = format!("{source_name}/{file_id}");
    format!("kf-{}", uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()))
}

/// Counts of what an apply changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub updated: usize,
    pub pruned: usize,
}

/// Bring the source's KnowledgeFiles in line with `files`.
///
/// Existing files are updated in place and new ones created. Files no
/// longer reported are deleted only when `prune` is set.
pub async fn apply_files(
    api: &Api<KnowledgeFile>,
    source: &KnowledgeSource,
    files: &BTreeMap<String, FileDetails>,
    prune: bool,
) -> Result<ApplyStats, StoreError> {
    let source_name = &source.metadata.name;
    let existing: BTreeMap<String, KnowledgeFile> = api
        .list(FieldSelector::default().field(SOURCE_NAME_FIELD, source_name.as_str()))
        .await?
        .into_iter()
        .map(|f| (f.metadata.name.clone(), f))
        .collect();

    let mut stats = ApplyStats::default();
    let mut wanted = BTreeSet::new();

    for (id, details) in files {
        let file_id = if details.file_id.is_empty() {
            id.as_str()
        } else {
            details.file_id.as_str()
        };
        let name = file_object_name(source_name, file_id);
        let spec = KnowledgeFileSpec {
            knowledge_source_name: source_name.clone(),
            knowledge_set_name: source.spec.knowledge_set_name.clone(),
            file_id: file_id.to_string(),
            file_name: details.file_path.clone(),
            url: details.url.clone(),
            checksum: details.checksum.clone(),
            updated_at: details.updated_at.clone(),
            size_in_bytes: details.size_in_bytes,
        };
        wanted.insert(name.clone());

        match existing.get(&name) {
            Some(current) if current.spec == spec => {}
            Some(current) => {
                let mut next = current.clone();
                next.spec = spec;
                api.update(&next).await?;
                stats.updated += 1;
            }
            None => {
                let file = KnowledgeFile {
                    metadata: ObjectMeta::new(source.metadata.namespace.clone(), name.clone()),
                    spec,
                };
                match api.create(&file).await {
                    Ok(_) => stats.created += 1,
                    Err(StoreError::AlreadyExists { .. }) => {
                        let mut current = api.get(&name).await?;
                        current.spec = file.spec;
                        api.update(&current).await?;
                        stats.updated += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    if prune {
        for (name, file) in &existing {
            if wanted.contains(name) || file.metadata.is_deleting() {
                continue;
            }
            match api.delete(name).await {
                Ok(()) => stats.pruned += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
    }

    debug!(
        source = %source_name,
        created = stats.created,
        updated = stats.updated,
        pruned = stats.pruned,
        "Applied knowledge files"
    );
    Ok(stats)
}
