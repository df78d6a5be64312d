//! Live task progress: event type, stream codec, hub, HTTP surface.

pub mod client;
pub mod codec;
pub mod event;
pub mod hub;
pub mod routes;

pub use client::ProgressClient;
pub use codec::{Decoder, decode_stream, encode_event, encode_marker};
pub use event::{EventKind, ProgressEvent, collect_content};
pub use hub::{ProgressHub, Received, Scope, Subscription};
pub use routes::{ProgressState, progress_routes};
