//! Persistence layer: versioned objects with optimistic concurrency and watches.

pub mod api;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;
mod watch;

pub use api::{Api, WatchEvent, WatchStream};
pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{FieldSelector, ObjectStore, RawObject, RawWatchEvent, WatchReceiver};
