//! Watch fan-out shared by the store backends.
//!
//! Every committed write is published once on a broadcast channel; each
//! watcher gets a forwarding task that filters by kind and selector and
//! feeds its own bounded mpsc channel.

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::traits::{FieldSelector, RawWatchEvent, WatchReceiver};

const BROADCAST_CAPACITY: usize = 1024;
const WATCHER_BUFFER: usize = 256;

pub(crate) struct WatchHub {
    tx: broadcast::Sender<RawWatchEvent>,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish a committed change. Call while holding the write lock so
    /// watchers observe changes in commit order.
    pub(crate) fn publish(&self, event: RawWatchEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    /// Start a filtered watch. The subscription is taken before returning,
    /// so every change committed after this call is delivered.
    pub(crate) fn watch(&self, kind: &str, selector: &FieldSelector) -> WatchReceiver {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(WATCHER_BUFFER);
        let kind = kind.to_string();
        let selector = selector.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = out_tx.closed() => break,
                    received = rx.recv() => received,
                };
                let event = match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let _ = out_tx
                            .send(RawWatchEvent::Error(format!(
                                "watch fell behind by {n} events"
                            )))
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let relevant = event
                    .object()
                    .is_some_and(|obj| obj.kind == kind && selector.matches(obj));
                if !relevant {
                    continue;
                }
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(kind = %kind, "Watch closed");
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::ObjectMeta;
    use crate::store::traits::RawObject;

    fn raw(kind: &str, name: &str) -> RawObject {
        RawObject {
            kind: kind.into(),
            metadata: ObjectMeta::new("default", name),
            fields: BTreeMap::new(),
            body: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn watch_filters_by_kind_and_name() {
        let hub = WatchHub::new();
        let mut rx = hub.watch("Thread", &FieldSelector::default().name("t1"));

        hub.publish(RawWatchEvent::Added(raw("KnowledgeSource", "t1")));
        hub.publish(RawWatchEvent::Added(raw("Thread", "t2")));
        hub.publish(RawWatchEvent::Modified(raw("Thread", "t1")));

        let event = rx.recv().await.unwrap();
        match event {
            RawWatchEvent::Modified(obj) => assert_eq!(obj.metadata.name, "t1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_stops_forwarder() {
        let hub = WatchHub::new();
        let rx = hub.watch("Thread", &FieldSelector::default());
        drop(rx);
        hub.publish(RawWatchEvent::Added(raw("Thread", "t1")));
        tokio::task::yield_now().await;
        // The forwarder exits once its send fails; publishing must not block.
        hub.publish(RawWatchEvent::Added(raw("Thread", "t2")));
    }

    #[tokio::test]
    async fn dropped_receiver_stops_forwarder_without_matching_events() {
        let hub = WatchHub::new();
        for i in 0..20 {
            let rx = hub.watch("Thread", &FieldSelector::default().name(format!("t{i}")));
            drop(rx);
        }
        for i in 0..20 {
            hub.publish(RawWatchEvent::Added(raw("KnowledgeSource", &format!("s{i}"))));
            hub.publish(RawWatchEvent::Added(raw("Thread", &format!("other{i}"))));
        }

        // Only unrelated events were published, yet every forwarder lets go
        // of its broadcast subscription.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while hub.tx.receiver_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("forwarders still subscribed");
    }
}
