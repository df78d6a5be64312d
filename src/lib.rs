//! Knowledge Sync: keeps knowledge sources and their files in step with
//! external data providers.

pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod invoker;
pub mod knowledge;
pub mod model;
pub mod progress;
pub mod retry;
pub mod server;
pub mod store;
pub mod threads;
pub mod wait;
pub mod workspace;
