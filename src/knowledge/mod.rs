//! Knowledge source sync: metadata contract, sync runs, schedules and cleanup.

pub mod cleanup;
pub mod metadata;
pub mod reconciler;
pub mod reschedule;
pub mod sync;

pub use reconciler::KnowledgeSourceReconciler;
pub use sync::{SyncController, SyncDeps};

/// Finalizer guarding a knowledge source's derived objects.
pub const FINALIZER: &str = "knowledge-sync/knowledge-source";
