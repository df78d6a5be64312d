//! Line-oriented event-stream codec.
//!
//! Stanzas are separated by a blank line. An `event: <name>` line sets the
//! current event name until the next blank line; `data: <json>` lines are
//! decoded as progress events only while the name is empty or `message`.
//! Other names are out-of-band markers (such as heartbeats) and their data
//! is skipped. A data line that is not valid JSON still yields an event,
//! carrying the parse error in `error`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::event::ProgressEvent;

/// MIME type of encoded streams.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Event name under which progress records are decoded.
pub const DEFAULT_EVENT: &str = "message";

/// Marker name used for keep-alive stanzas.
pub const PING_EVENT: &str = "ping";

/// Encode one progress record as a stanza.
pub fn encode_event(event: &ProgressEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Encode an out-of-band marker stanza.
pub fn encode_marker(name: &str, data: &str) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

/// Incremental line decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    event: String,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator).
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            self.event.clear();
            return None;
        }

        if let Some(name) = field_value(line, "event") {
            self.event = name.trim().to_string();
            return None;
        }

        let data = field_value(line, "data")?;
        if !self.event.is_empty() && self.event != DEFAULT_EVENT {
            return None;
        }
        Some(match serde_json::from_str::<ProgressEvent>(data) {
            Ok(event) => event,
            Err(e) => ProgressEvent::decode_error(&e),
        })
    }

    /// Decode a complete buffer.
    pub fn decode_all(&mut self, input: &str) -> Vec<ProgressEvent> {
        input.lines().filter_map(|l| self.feed_line(l)).collect()
    }
}

/// `name: value` with one optional space after the colon.
fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Decode `reader` on a background task.
///
/// A line that is not valid UTF-8 yields an event carrying the decode error
/// and decoding carries on with the next line. The returned channel closes
/// when the reader hits EOF or fails, or when the receiver is dropped.
pub fn decode_stream<R>(mut reader: R, buffer: usize) -> mpsc::Receiver<ProgressEvent>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        let mut decoder = Decoder::new();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Progress stream read failed");
                    break;
                }
            }
            if raw.last() == Some(&b'\n') {
                raw.pop();
            }

            let event = match std::str::from_utf8(&raw) {
                Ok(line) => decoder.feed_line(line),
                Err(e) => Some(ProgressEvent::error(
                    "",
                    format!("invalid UTF-8 in progress stream: {e}"),
                )),
            };
            if let Some(event) = event
                && tx.send(event).await.is_err()
            {
                break;
            }
        }
    });
    rx
}
