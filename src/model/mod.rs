//! Stored object types.

pub mod knowledge;
pub mod meta;
pub mod thread;

pub use knowledge::{
    KnowledgeFile, KnowledgeFileSpec, KnowledgeSource, KnowledgeSourceManifest,
    KnowledgeSourceSpec, KnowledgeSourceState, KnowledgeSourceStatus, SOURCE_NAME_FIELD,
};
pub use meta::{HasStatus, ObjectMeta, Resource};
pub use thread::{Thread, ThreadSpec, ThreadStatus};
