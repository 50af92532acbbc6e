// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Source
//!
//! Pull-based message source the ingestor drains. Subjects use NATS-style
//! wildcards: `*` matches exactly one token, `>` matches one or more
//! trailing tokens.
//!
//! [`InMemoryEventSource`] is the in-process implementation used by tests
//! and the `simulate` command. Messages are queued per subscription at
//! publish time; a subject published before anyone subscribed is dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::domain::event::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Concrete subject the message was published on
    pub subject: String,
    pub payload: Vec<u8>,
    /// Source-assigned delivery sequence, used for acknowledgement
    pub sequence: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EventSourceError {
    #[error("not subscribed to '{0}'")]
    NotSubscribed(String),

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, subject: &str) -> Result<(), EventSourceError>;

    async fn unsubscribe_all(&self) -> Result<(), EventSourceError>;

    /// Up to `max` messages; waits at most `timeout` for the first one.
    /// An empty batch is not an error.
    async fn fetch(&self, subject: &str, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, EventSourceError>;

    async fn ack(&self, message: &ReceivedMessage) -> Result<(), EventSourceError>;
}

/// Outbound side of the engine: publishes the events it emits
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: &Event) -> anyhow::Result<()>;
}

/// Whether `subject` matches the subscription `pattern`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_subject(subject: &str) -> Result<(), EventSourceError> {
    let tokens: Vec<&str> = subject.split('.').collect();
    let valid = !subject.is_empty()
        && tokens.iter().all(|t| !t.is_empty())
        && tokens
            .iter()
            .enumerate()
            .all(|(i, t)| *t != ">" || i == tokens.len() - 1);
    if valid {
        Ok(())
    } else {
        Err(EventSourceError::InvalidSubject(subject.to_string()))
    }
}

#[derive(Default)]
struct SourceState {
    subscriptions: HashMap<String, VecDeque<ReceivedMessage>>,
    next_sequence: u64,
    acked: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryEventSource {
    state: Arc<Mutex<SourceState>>,
    notify: Arc<Notify>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` on every subscription matching `subject`.
    /// Returns the number of subscriptions that received it.
    pub fn publish(&self, subject: &str, payload: Vec<u8>) -> usize {
        let delivered = {
            let mut state = self.state.lock();
            state.next_sequence += 1;
            let message = ReceivedMessage {
                subject: subject.to_string(),
                payload,
                sequence: state.next_sequence,
            };

            let mut delivered = 0;
            for (pattern, queue) in state.subscriptions.iter_mut() {
                if subject_matches(pattern, subject) {
                    queue.push_back(message.clone());
                    delivered += 1;
                }
            }
            delivered
        };

        if delivered == 0 {
            tracing::trace!(subject, "No subscription matches published subject");
        }
        self.notify.notify_waiters();
        delivered
    }

    /// Publish an event on the subject named after its type
    pub fn publish_event(&self, event: &Event) -> Result<usize, EventSourceError> {
        let payload = serde_json::to_vec(event).map_err(|e| EventSourceError::Transport(e.to_string()))?;
        Ok(self.publish(&event.event_type, payload))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.state.lock().subscriptions.keys().cloned().collect();
        subjects.sort();
        subjects
    }

    pub fn pending(&self, subject: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(subject)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn subscribe(&self, subject: &str) -> Result<(), EventSourceError> {
        validate_subject(subject)?;
        self.state.lock().subscriptions.entry(subject.to_string()).or_default();
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<(), EventSourceError> {
        self.state.lock().subscriptions.clear();
        // Wake pending fetches so they observe the removal
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, subject: &str, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, EventSourceError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking the queue so a publish in between is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                let queue = state
                    .subscriptions
                    .get_mut(subject)
                    .ok_or_else(|| EventSourceError::NotSubscribed(subject.to_string()))?;
                if !queue.is_empty() {
                    let take = max.min(queue.len());
                    return Ok(queue.drain(..take).collect());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, _message: &ReceivedMessage) -> Result<(), EventSourceError> {
        self.state.lock().acked += 1;
        Ok(())
    }
}

/// Loopback: emitted events are fed straight back to subscribers
#[async_trait]
impl EventDispatcher for InMemoryEventSource {
    async fn dispatch(&self, event: &Event) -> anyhow::Result<()> {
        self.publish_event(event)?;
        Ok(())
    }
}
