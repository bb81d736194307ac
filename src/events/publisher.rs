//! Bounded per-run event logs with independent subscriber cursors
//!
//! Publishing never blocks. When a log is full the oldest `Token` event is
//! evicted to make room; if the log holds no tokens, an incoming token is
//! dropped instead. Control events are always appended, so a log may grow
//! past its capacity when it holds nothing but control events.

use crate::core::context::Payload;
use crate::events::{Event, EventKind};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default number of events retained per run
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct LogInner {
    events: VecDeque<Event>,
    next_sequence: u64,
    closed: bool,
    dropped: u64,
}

/// Append-only event log of one run
#[derive(Debug)]
pub struct EventLog {
    run_id: Uuid,
    capacity: usize,
    inner: Mutex<LogInner>,
    notify: Notify,
}

enum Poll {
    Ready(Event),
    Closed,
    Pending,
}

impl EventLog {
    pub fn new(run_id: Uuid, capacity: usize) -> Self {
        Self {
            run_id,
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append an event, returning its sequence number
    ///
    /// Returns `None` when the event was dropped (token under pressure) or
    /// the log is already closed.
    pub fn publish(
        &self,
        step_id: Option<&str>,
        kind: EventKind,
        payload: Payload,
    ) -> Option<u64> {
        let sequence = {
            let mut inner = self.lock();
            if inner.closed {
                debug!(run_id = %self.run_id, kind = %kind, "Ignoring event published after close");
                return None;
            }

            if inner.events.len() >= self.capacity {
                let oldest_token = inner.events.iter().position(|e| e.kind == EventKind::Token);
                match oldest_token {
                    Some(index) => {
                        inner.events.remove(index);
                        inner.dropped += 1;
                    }
                    None if kind == EventKind::Token => {
                        inner.dropped += 1;
                        trace!(run_id = %self.run_id, "Dropping token event, log is full");
                        return None;
                    }
                    None => {}
                }
            }

            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.events.push_back(Event {
                run_id: self.run_id,
                step_id: step_id.map(str::to_string),
                kind,
                payload,
                sequence,
                timestamp: Utc::now(),
            });
            sequence
        };

        self.notify.notify_waiters();
        Some(sequence)
    }

    /// Mark the log complete; subscribers drain what is left and then end
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Number of token events evicted or rejected so far
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Sequence the next published event will receive
    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }

    /// Copy of every retained event, in sequence order
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().collect()
    }

    /// Open a cursor at `from_sequence`
    pub fn subscribe(self: &Arc<Self>, from_sequence: u64) -> Subscription {
        Subscription {
            log: Arc::clone(self),
            cursor: from_sequence,
        }
    }

    fn poll_from(&self, cursor: u64) -> Poll {
        let inner = self.lock();
        let index = inner.events.partition_point(|e| e.sequence < cursor);
        match inner.events.get(index) {
            Some(event) => Poll::Ready(event.clone()),
            None if inner.closed => Poll::Closed,
            None => Poll::Pending,
        }
    }
}

/// Independent reader over one run's event log
///
/// Delivery is at-least-once across reconnects: a client that resubscribes
/// from its last acknowledged sequence sees every retained event after it.
#[derive(Debug)]
pub struct Subscription {
    log: Arc<EventLog>,
    cursor: u64,
}

impl Subscription {
    /// Next event at or after the cursor, waiting for one if necessary
    ///
    /// Returns `None` once the log is closed and fully drained.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let notified = self.log.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.log.poll_from(self.cursor) {
                Poll::Ready(event) => {
                    self.cursor = event.sequence + 1;
                    return Some(event);
                }
                Poll::Closed => return None,
                Poll::Pending => notified.await,
            }
        }
    }

    /// Next event if one is already available
    pub fn try_next(&mut self) -> Option<Event> {
        match self.log.poll_from(self.cursor) {
            Poll::Ready(event) => {
                self.cursor = event.sequence + 1;
                Some(event)
            }
            _ => None,
        }
    }

    /// Read until the log is closed
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Sequence of the next event this subscription will yield
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn run_id(&self) -> Uuid {
        self.log.run_id()
    }
}

/// Registry of per-run event logs
#[derive(Debug)]
pub struct EventPublisher {
    capacity: usize,
    logs: Mutex<HashMap<Uuid, Arc<EventLog>>>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<EventLog>>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (or return the existing) log for a run
    pub fn open(&self, run_id: Uuid) -> Arc<EventLog> {
        let mut logs = self.logs();
        Arc::clone(
            logs.entry(run_id)
                .or_insert_with(|| Arc::new(EventLog::new(run_id, self.capacity))),
        )
    }

    pub fn log(&self, run_id: Uuid) -> Option<Arc<EventLog>> {
        self.logs().get(&run_id).cloned()
    }

    /// Publish to a run's log; `None` if the run has no log or the event was dropped
    pub fn publish(
        &self,
        run_id: Uuid,
        step_id: Option<&str>,
        kind: EventKind,
        payload: Payload,
    ) -> Option<u64> {
        self.log(run_id)?.publish(step_id, kind, payload)
    }

    pub fn subscribe(&self, run_id: Uuid, from_sequence: u64) -> Option<Subscription> {
        self.log(run_id).map(|log| log.subscribe(from_sequence))
    }

    /// Forget a run's log; existing subscriptions keep their handle
    pub fn remove(&self, run_id: Uuid) -> Option<Arc<EventLog>> {
        self.logs().remove(&run_id)
    }
}
