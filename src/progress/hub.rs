//! Progress hub: per-run history plus live fan-out.
//!
//! Publishers append events under a run; subscribers take a snapshot of
//! the history and a live subscription in one step, so a replaying client
//! neither misses nor duplicates events.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::event::ProgressEvent;

const LIVE_CAPACITY: usize = 1024;

/// Default number of runs whose history is retained.
pub const DEFAULT_MAX_RUNS: usize = 256;

/// Default number of events retained per run. Past it the oldest events of
/// the run are dropped and replays start with an error record saying so.
pub const DEFAULT_MAX_EVENTS_PER_RUN: usize = 10_000;

/// What a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Run(String),
    Thread(String),
}

impl Scope {
    fn includes(&self, run_id: &str, thread: &str) -> bool {
        match self {
            Scope::Run(id) => id == run_id,
            Scope::Thread(t) => t == thread,
        }
    }
}

/// Every published event carries a hub-wide sequence number, starting at 1.
#[derive(Debug, Clone)]
struct Published {
    seq: u64,
    thread: String,
    event: ProgressEvent,
}

struct Recorded {
    seq: u64,
    event: ProgressEvent,
}

struct RunHistory {
    thread: String,
    events: VecDeque<Recorded>,
    /// Events dropped from the front of the run, and the newest of them.
    discarded: u64,
    discarded_through: u64,
    last_time: Option<DateTime<Utc>>,
}

impl RunHistory {
    fn newest_seq(&self) -> u64 {
        self.events
            .back()
            .map_or(self.discarded_through, |r| r.seq)
    }

    fn replay(&self, run_id: &str, out: &mut Vec<ProgressEvent>) {
        if self.discarded > 0 {
            out.push(ProgressEvent::error(
                run_id,
                format!("{} earlier progress events were discarded", self.discarded),
            ));
        }
        out.extend(self.events.iter().map(|r| r.event.clone()));
    }
}

#[derive(Default)]
struct HubState {
    /// Run ids, oldest first.
    order: VecDeque<String>,
    runs: HashMap<String, RunHistory>,
    last_seq: u64,
    /// Newest sequence number held by any evicted run.
    evicted_through: u64,
}

pub struct ProgressHub {
    state: Mutex<HubState>,
    live: broadcast::Sender<Published>,
    max_runs: usize,
    max_events: usize,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RUNS)
    }

    pub fn with_capacity(max_runs: usize) -> Self {
        Self::with_limits(max_runs, DEFAULT_MAX_EVENTS_PER_RUN)
    }

    pub fn with_limits(max_runs: usize, max_events_per_run: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            state: Mutex::new(HubState::default()),
            live,
            max_runs: max_runs.max(1),
            max_events: max_events_per_run.max(1),
        }
    }

    /// Record `event` for its run in `thread` and fan it out.
    ///
    /// The event time is filled in when missing and clamped so that it
    /// never goes backwards within a run.
    pub async fn publish(&self, thread: &str, mut event: ProgressEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.runs.contains_key(&event.run_id) {
            if state.order.len() >= self.max_runs
                && let Some(evicted) = state.order.pop_front()
                && let Some(run) = state.runs.remove(&evicted)
            {
                state.evicted_through = state.evicted_through.max(run.newest_seq());
                debug!(run = %evicted, "Evicted progress history");
            }
            state.order.push_back(event.run_id.clone());
            state.runs.insert(
                event.run_id.clone(),
                RunHistory {
                    thread: thread.to_string(),
                    events: VecDeque::new(),
                    discarded: 0,
                    discarded_through: 0,
                    last_time: None,
                },
            );
        }

        let Some(run) = state.runs.get_mut(&event.run_id) else {
            return;
        };
        state.last_seq += 1;
        let seq = state.last_seq;

        let time = event.time.unwrap_or_else(Utc::now);
        let time = match run.last_time {
            Some(last) if time < last => last,
            _ => time,
        };
        event.time = Some(time);
        run.last_time = Some(time);

        while run.events.len() >= self.max_events {
            let Some(dropped) = run.events.pop_front() else {
                break;
            };
            if run.discarded == 0 {
                debug!(run = %event.run_id, "Progress history full, dropping oldest events");
            }
            run.discarded += 1;
            run.discarded_through = dropped.seq;
        }
        run.events.push_back(Recorded {
            seq,
            event: event.clone(),
        });

        // Sent under the lock so live order matches history order.
        let _ = self.live.send(Published {
            seq,
            thread: run.thread.clone(),
            event,
        });
    }

    /// Snapshot the history for `scope` and subscribe to what follows.
    pub async fn subscribe(&self, scope: Scope) -> (Vec<ProgressEvent>, Subscription) {
        let state = self.state.lock().await;
        let mut history = Vec::new();
        match &scope {
            Scope::Run(run_id) => {
                if let Some(run) = state.runs.get(run_id) {
                    run.replay(run_id, &mut history);
                }
            }
            Scope::Thread(thread) => {
                for id in &state.order {
                    if let Some(run) = state.runs.get(id)
                        && run.thread == *thread
                    {
                        run.replay(id, &mut history);
                    }
                }
            }
        }
        let rx = self.live.subscribe();
        let subscription = Subscription {
            rx,
            scope,
            cursor: state.last_seq,
        };
        (history, subscription)
    }

    /// Events in `scope` published after sequence number `after`, in
    /// publish order, along with the newest sequence number so far.
    ///
    /// Returns `None` when any of those events may no longer be retained.
    pub async fn history_since(
        &self,
        scope: &Scope,
        after: u64,
    ) -> Option<(Vec<ProgressEvent>, u64)> {
        let state = self.state.lock().await;
        let mut missed: Vec<&Recorded> = Vec::new();
        let mut found = false;
        for (id, run) in &state.runs {
            if !scope.includes(id, &run.thread) {
                continue;
            }
            found = true;
            if run.discarded_through > after {
                return None;
            }
            missed.extend(run.events.iter().filter(|r| r.seq > after));
        }
        // A run scope only depends on its own run; a thread may have lost
        // an evicted run without trace.
        let run_present = matches!(scope, Scope::Run(_)) && found;
        if !run_present && state.evicted_through > after {
            return None;
        }

        missed.sort_by_key(|r| r.seq);
        let events = missed.into_iter().map(|r| r.event.clone()).collect();
        Some((events, state.last_seq))
    }

    /// Thread a run was published under.
    pub async fn thread_of(&self, run_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .runs
            .get(run_id)
            .map(|r| r.thread.clone())
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscription yielded.
#[derive(Debug)]
pub enum Received {
    Event(ProgressEvent),
    /// The subscriber fell behind and `n` events were skipped. Call
    /// [`Subscription::catch_up`] to recover them.
    Lagged(u64),
    Closed,
}

/// A live, scoped view of published events.
pub struct Subscription {
    rx: broadcast::Receiver<Published>,
    scope: Scope,
    /// Every event in scope up to this sequence number has been yielded.
    cursor: u64,
}

impl Subscription {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub async fn recv(&mut self) -> Received {
        loop {
            match self.rx.recv().await {
                Ok(published) => {
                    if published.seq <= self.cursor {
                        continue;
                    }
                    self.cursor = published.seq;
                    if self.scope.includes(&published.event.run_id, &published.thread) {
                        return Received::Event(published.event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return Received::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => return Received::Closed,
            }
        }
    }

    /// Fetch from `hub` what this subscription skipped while lagging.
    ///
    /// Later calls to [`recv`](Self::recv) skip anything returned here.
    /// `None` means part of the gap is gone for good.
    pub async fn catch_up(&mut self, hub: &ProgressHub) -> Option<Vec<ProgressEvent>> {
        let (events, latest) = hub.history_since(&self.scope, self.cursor).await?;
        self.cursor = self.cursor.max(latest);
        Some(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[tokio::test]
    async fn replay_then_live_without_gaps() {
        let hub = ProgressHub::new();
        hub.publish("ks-docs", ProgressEvent::content("run-1", "a")).await;
        hub.publish("ks-docs", ProgressEvent::content("run-1", "b")).await;

        let (history, mut sub) = hub.subscribe(Scope::Run("run-1".into())).await;
        assert_eq!(history.len(), 2);

        hub.publish("ks-docs", ProgressEvent::content("run-2", "other")).await;
        hub.publish("ks-docs", ProgressEvent::content("run-1", "c")).await;

        match sub.recv().await {
            Received::Event(e) => assert_eq!(e.content, "c"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_scope_spans_runs() {
        let hub = ProgressHub::new();
        hub.publish("ks-docs", ProgressEvent::content("run-1", "a")).await;
        hub.publish("ks-wiki", ProgressEvent::content("run-9", "x")).await;
        hub.publish("ks-docs", ProgressEvent::content("run-2", "b")).await;

        let (history, _sub) = hub.subscribe(Scope::Thread("ks-docs".into())).await;
        let runs: Vec<&str> = history.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(runs, vec!["run-1", "run-2"]);
        assert_eq!(hub.thread_of("run-9").await.as_deref(), Some("ks-wiki"));
    }

    #[tokio::test]
    async fn times_never_go_backwards() {
        let hub = ProgressHub::new();
        let now = Utc::now();
        let mut first = ProgressEvent::content("run-1", "a");
        first.time = Some(now);
        let mut second = ProgressEvent::content("run-1", "b");
        second.time = Some(now - ChronoDuration::seconds(30));

        hub.publish("t", first).await;
        hub.publish("t", second).await;
        hub.publish("t", ProgressEvent::content("run-1", "c")).await;

        let (history, _) = hub.subscribe(Scope::Run("run-1".into())).await;
        assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(history[1].time, Some(now));
    }

    #[tokio::test]
    async fn oldest_run_is_evicted() {
        let hub = ProgressHub::with_capacity(2);
        for run in ["r1", "r2", "r3"] {
            hub.publish("t", ProgressEvent::content(run, "x")).await;
        }
        let (history, _) = hub.subscribe(Scope::Run("r1".into())).await;
        assert!(history.is_empty());
        let (history, _) = hub.subscribe(Scope::Thread("t".into())).await;
        assert_eq!(history.len(), 2);
        assert!(hub.history_since(&Scope::Run("r1".into()), 0).await.is_none());
        assert!(hub.history_since(&Scope::Thread("t".into()), 0).await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscription_catches_up_from_history() {
        let hub = ProgressHub::new();
        let (_, mut sub) = hub.subscribe(Scope::Run("run-1".into())).await;

        let total = LIVE_CAPACITY + 50;
        for i in 0..total {
            hub.publish("ks-docs", ProgressEvent::content("run-1", i.to_string()))
                .await;
            hub.publish("ks-docs", ProgressEvent::content("run-2", "noise"))
                .await;
        }

        assert!(matches!(sub.recv().await, Received::Lagged(_)));
        let missed = sub.catch_up(&hub).await.unwrap();
        let contents: Vec<String> = missed.iter().map(|e| e.content.clone()).collect();
        let expected: Vec<String> = (0..total).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);

        // What is still buffered live was already refilled.
        hub.publish("ks-docs", ProgressEvent::run_complete("run-1")).await;
        match sub.recv().await {
            Received::Event(e) => assert!(e.run_complete),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_history_is_capped() {
        let hub = ProgressHub::with_limits(4, 3);
        for c in ["a", "b", "c", "d", "e"] {
            hub.publish("ks-docs", ProgressEvent::content("run-1", c)).await;
        }

        let (history, _) = hub.subscribe(Scope::Run("run-1".into())).await;
        assert_eq!(history.len(), 4);
        assert!(history[0].error.contains("2 earlier"));
        assert_eq!(history[0].run_id, "run-1");
        let kept: Vec<&str> = history[1..].iter().map(|e| e.content.as_str()).collect();
        assert_eq!(kept, vec!["c", "d", "e"]);

        let scope = Scope::Run("run-1".into());
        assert!(hub.history_since(&scope, 0).await.is_none());
        let (events, latest) = hub.history_since(&scope, 2).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(latest, 5);
    }
}
