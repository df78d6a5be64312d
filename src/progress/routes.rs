//! HTTP endpoints streaming progress as `text/event-stream`.
//!
//! - `GET /runs/{id}/events?follow=` streams one run.
//! - `GET /threads/{id}/events?follow=` streams every run of a thread.
//!
//! Without `follow` the history is replayed and the response ends. With
//! `follow` a `replayComplete` record marks the end of history and live
//! events follow; a run stream ends after that run's `runComplete`. A
//! client that falls behind the live feed is refilled from history; if that
//! history is gone the stream ends with an `error` record.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::codec::{CONTENT_TYPE, PING_EVENT, encode_event, encode_marker};
use super::event::ProgressEvent;
use super::hub::{ProgressHub, Received, Scope, Subscription};

const STREAM_BUFFER: usize = 64;
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Shared state for the progress endpoints.
#[derive(Clone)]
pub struct ProgressState {
    pub hub: Arc<ProgressHub>,
    /// Idle interval after which a followed stream sends a ping.
    pub heartbeat: Duration,
}

impl ProgressState {
    pub fn new(hub: Arc<ProgressHub>, heartbeat: Duration) -> Self {
        Self { hub, heartbeat }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub follow: bool,
}

/// Build the Axum router for the progress endpoints.
pub fn progress_routes(state: ProgressState) -> Router {
    Router::new()
        .route("/runs/{id}/events", get(run_events))
        .route("/threads/{id}/events", get(thread_events))
        .with_state(state)
}

async fn run_events(
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<ProgressState>,
) -> impl IntoResponse {
    info!(run = %run_id, follow = query.follow, "Progress stream requested");
    stream_response(state, Scope::Run(run_id), query.follow).await
}

async fn thread_events(
    Path(thread): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<ProgressState>,
) -> impl IntoResponse {
    info!(thread = %thread, follow = query.follow, "Progress stream requested");
    stream_response(state, Scope::Thread(thread), query.follow).await
}

async fn stream_response(state: ProgressState, scope: Scope, follow: bool) -> Response {
    let (history, subscription) = state.hub.subscribe(scope).await;
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_BUFFER);

    tokio::spawn(pump(
        state.hub,
        history,
        subscription,
        follow,
        state.heartbeat,
        tx,
    ));

    let mut response = Body::from_stream(ReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Write history, then live events, until the stream is done or the client leaves.
async fn pump(
    hub: Arc<ProgressHub>,
    history: Vec<ProgressEvent>,
    mut subscription: Subscription,
    follow: bool,
    heartbeat: Duration,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let run_scoped = matches!(subscription.scope(), Scope::Run(_));
    let mut finished = false;

    for event in &history {
        finished |= run_scoped && event.run_complete;
        if !send_event(&tx, event).await {
            return;
        }
    }
    if !follow {
        return;
    }
    if !send_event(&tx, &ProgressEvent::replay_complete()).await || finished {
        return;
    }

    let mut ping = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
    ping.tick().await;

    loop {
        tokio::select! {
            received = subscription.recv() => match received {
                Received::Event(event) => {
                    if !send_event(&tx, &event).await {
                        break;
                    }
                    ping.reset();
                    if run_scoped && event.run_complete {
                        break;
                    }
                }
                Received::Lagged(n) => {
                    warn!(missed = n, "Progress stream client lagged, refilling from history");
                    let Some(missed) = subscription.catch_up(&hub).await else {
                        let run_id = match subscription.scope() {
                            Scope::Run(id) => id.as_str(),
                            Scope::Thread(_) => "",
                        };
                        let gap = ProgressEvent::error(
                            run_id,
                            "progress events were discarded before they could be sent; reconnect to replay",
                        );
                        send_event(&tx, &gap).await;
                        break;
                    };
                    let mut done = false;
                    for event in &missed {
                        if !send_event(&tx, event).await || (run_scoped && event.run_complete) {
                            done = true;
                            break;
                        }
                    }
                    if done {
                        break;
                    }
                    ping.reset();
                }
                Received::Closed => break,
            },
            _ = ping.tick() => {
                let marker = encode_marker(PING_EVENT, "{}");
                if tx.send(Ok(Bytes::from(marker))).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Progress stream closed");
}

async fn send_event(tx: &mpsc::Sender<Result<Bytes, Infallible>>, event: &ProgressEvent) -> bool {
    match encode_event(event) {
        Ok(stanza) => tx.send(Ok(Bytes::from(stanza))).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode progress event");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::progress::codec::Decoder;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn app(hub: Arc<ProgressHub>) -> Router {
        progress_routes(ProgressState::new(hub, Duration::from_secs(15)))
    }

    #[tokio::test]
    async fn replay_without_follow_ends() {
        let hub = Arc::new(ProgressHub::new());
        hub.publish("ks-docs", ProgressEvent::content("run-1", "hello"))
            .await;
        hub.publish("ks-docs", ProgressEvent::run_complete("run-1"))
            .await;

        let response = app(hub)
            .oneshot(
                Request::builder()
                    .uri("/runs/run-1/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static(CONTENT_TYPE)
        );

        let events = Decoder::new().decode_all(&body_text(response).await);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "hello");
        assert!(events[1].run_complete);
    }

    #[tokio::test]
    async fn follow_on_completed_run_ends_after_marker() {
        let hub = Arc::new(ProgressHub::new());
        hub.publish("ks-docs", ProgressEvent::content("run-1", "x"))
            .await;
        hub.publish("ks-docs", ProgressEvent::run_complete("run-1"))
            .await;

        let response = app(hub)
            .oneshot(
                Request::builder()
                    .uri("/runs/run-1/events?follow=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let events = Decoder::new().decode_all(&body_text(response).await);
        assert_eq!(events.len(), 3);
        assert!(events[2].replay_complete);
    }

    #[tokio::test]
    async fn slow_follower_receives_every_event() {
        let hub = Arc::new(ProgressHub::new());
        let response = app(Arc::clone(&hub))
            .oneshot(
                Request::builder()
                    .uri("/runs/run-1/events?follow=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Far more than the live buffer holds, published before any read.
        for i in 0..3000 {
            hub.publish("ks-docs", ProgressEvent::content("run-1", format!("{i}\n")))
                .await;
        }
        hub.publish("ks-docs", ProgressEvent::run_complete("run-1"))
            .await;

        let events = Decoder::new().decode_all(&body_text(response).await);
        assert!(events[0].replay_complete);
        assert!(events.iter().all(|e| e.error.is_empty()));
        let content: Vec<&str> = events
            .iter()
            .filter(|e| !e.content.is_empty())
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(content.len(), 3000);
        let expected: String = (0..3000).map(|i| format!("{i}\n")).collect();
        assert_eq!(content.concat(), expected);
        assert!(events.last().unwrap().run_complete);
    }

    #[tokio::test]
    async fn unrecoverable_lag_ends_with_error() {
        let hub = Arc::new(ProgressHub::with_limits(4, 16));
        let response = app(Arc::clone(&hub))
            .oneshot(
                Request::builder()
                    .uri("/runs/run-1/events?follow=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        for i in 0..3000 {
            hub.publish("ks-docs", ProgressEvent::content("run-1", format!("{i}\n")))
                .await;
        }

        let events = Decoder::new().decode_all(&body_text(response).await);
        let last = events.last().unwrap();
        assert_eq!(last.run_id, "run-1");
        assert!(last.error.contains("reconnect"));
        assert!(!events.iter().any(|e| e.run_complete));
    }

    #[tokio::test]
    async fn unknown_thread_replays_nothing() {
        let hub = Arc::new(ProgressHub::new());
        let response = app(hub)
            .oneshot(
                Request::builder()
                    .uri("/threads/ks-none/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(body_text(response).await.is_empty());
    }
}
