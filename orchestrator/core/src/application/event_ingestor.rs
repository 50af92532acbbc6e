// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Ingestor - Background pull loops feeding the event processor
//!
//! One loop per subscribed subject fetches batches from the
//! [`EventSource`]. Each decoded event is processed on its own task so a
//! correlation waiting on a lagging store never blocks the loop. Messages
//! are acknowledged after processing, including ones that fail: the
//! source's redelivery is not used as a retry mechanism.
//!
//! The subject set can be reconciled at runtime. A change tears down the
//! current loops, resubscribes and starts a fresh generation.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::event_correlator::CorrelationError;
use crate::application::event_processor::{EventProcessor, ProcessError};
use crate::domain::engine_config::IngestionConfig;
use crate::domain::event::Event;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::event_source::{EventSource, EventSourceError, ReceivedMessage};
use crate::infrastructure::metrics as engine_metrics;

struct Generation {
    subjects: Vec<String>,
    token: CancellationToken,
}

pub struct EventIngestor {
    source: Arc<dyn EventSource>,
    processor: Arc<EventProcessor>,
    config: IngestionConfig,
    event_bus: Option<Arc<EventBus>>,
    shutdown_token: CancellationToken,
    generation: Mutex<Option<Generation>>,
    // Serializes reconciliations; never held together with `generation`
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl EventIngestor {
    pub fn new(source: Arc<dyn EventSource>, processor: Arc<EventProcessor>, config: IngestionConfig) -> Self {
        Self {
            source,
            processor,
            config,
            event_bus: None,
            shutdown_token: CancellationToken::new(),
            generation: Mutex::new(None),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Publish correlation failures on `event_bus`
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.generation
            .lock()
            .as_ref()
            .map(|g| g.subjects.clone())
            .unwrap_or_default()
    }

    /// Subscribe to the configured subjects and run until shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let subjects = self.config.subjects.clone();
            if let Err(e) = self.reconcile_subjects(subjects).await {
                warn!(error = %e, "Failed to subscribe to configured subjects");
            }

            self.shutdown_token.cancelled().await;
            info!("Shutdown signal received, stopping event ingestion");
            if let Some(generation) = self.generation.lock().take() {
                generation.token.cancel();
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Bring the subscriptions in line with `subjects`.
    ///
    /// Returns `false` when the set is unchanged and nothing was restarted.
    pub async fn reconcile_subjects(self: &Arc<Self>, mut subjects: Vec<String>) -> Result<bool, EventSourceError> {
        subjects.sort();
        subjects.dedup();

        let _guard = self.reconcile_lock.lock().await;
        let previous = self.generation.lock().take();
        if let Some(previous) = previous {
            if previous.subjects == subjects {
                *self.generation.lock() = Some(previous);
                return Ok(false);
            }
            previous.token.cancel();
            info!(from = ?previous.subjects, to = ?subjects, "Subject set changed, restarting pull loops");
        }

        self.source.unsubscribe_all().await?;
        for subject in &subjects {
            self.source.subscribe(subject).await?;
        }

        let token = self.shutdown_token.child_token();
        for subject in &subjects {
            tokio::spawn(Arc::clone(self).pull_loop(subject.clone(), token.clone()));
        }
        *self.generation.lock() = Some(Generation { subjects, token });
        Ok(true)
    }

    async fn pull_loop(self: Arc<Self>, subject: String, token: CancellationToken) {
        debug!(subject = %subject, "Starting pull loop");

        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = self.source.fetch(&subject, self.config.batch_size, self.config.fetch_timeout()) => batch,
            };

            match batch {
                Ok(messages) => {
                    for message in messages {
                        self.handle_message(message);
                    }
                }
                Err(EventSourceError::NotSubscribed(_)) => {
                    debug!(subject = %subject, "Subscription removed, leaving pull loop");
                    break;
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Fetch failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_backoff()) => {}
                    }
                }
            }
        }

        debug!(subject = %subject, "Pull loop stopped");
    }

    fn handle_message(self: &Arc<Self>, message: ReceivedMessage) {
        let event: Event = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "Dropping malformed message");
                engine_metrics::record_malformed_message();
                let this = Arc::clone(self);
                tokio::spawn(async move { this.acknowledge(&message).await });
                return;
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(phase) = event.phase() {
                engine_metrics::record_event_ingested(phase.as_str());
            }
            this.process(event).await;
            this.acknowledge(&message).await;
        });
    }

    async fn process(&self, event: Event) {
        let event_id = event.id.clone();
        let event_type = event.event_type.clone();
        let keptn_context = event.shkeptncontext.clone();

        match self.processor.process(event).await {
            Ok(outcome) => debug!(
                event_id = %event_id,
                event_type = %event_type,
                dispatched = outcome.dispatched,
                "Processed event"
            ),
            Err(ProcessError::Correlation(e)) => {
                warn!(event_id = %event_id, event_type = %event_type, error = %e, "Dropping uncorrelated event");
                if let (Some(bus), CorrelationError::NoMatchingEvent { .. }) = (&self.event_bus, &e) {
                    bus.publish_correlation_failure(event_id, event_type, keptn_context, e.to_string());
                }
            }
            Err(e) => warn!(event_id = %event_id, event_type = %event_type, error = %e, "Failed to process event"),
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) {
        if let Err(e) = self.source.ack(message).await {
            warn!(subject = %message.subject, sequence = message.sequence, error = %e, "Ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::event_correlator::{CorrelatorConfig, EventCorrelator};
    use crate::application::lifecycle_hooks::LifecycleHooks;
    use crate::application::sequence_execution_service::SequenceExecutionService;
    use crate::domain::event::EventPhase;
    use crate::domain::payload::TaskNames;
    use crate::domain::sequence_execution::SequenceCatalog;
    use crate::infrastructure::event_bus::DomainEvent;
    use crate::infrastructure::event_source::{EventDispatcher, InMemoryEventSource};
    use crate::infrastructure::repositories::{InMemoryEventRepository, InMemorySequenceExecutionRepository};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Discard;

    #[async_trait]
    impl EventDispatcher for Discard {
        async fn dispatch(&self, _event: &Event) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ingestor(source: &InMemoryEventSource, events: &InMemoryEventRepository) -> EventIngestor {
        let processor = EventProcessor::new(
            Arc::new(EventCorrelator::new(
                Arc::new(events.clone()),
                CorrelatorConfig {
                    max_retries: 1,
                    retry_interval: Duration::from_millis(1),
                },
            )),
            Arc::new(SequenceExecutionService::new(
                Arc::new(InMemorySequenceExecutionRepository::new()),
                Arc::new(LifecycleHooks::new()),
                TaskNames::default(),
            )),
            SequenceCatalog::default(),
            Arc::new(Discard),
            TaskNames::default(),
        );
        EventIngestor::new(
            Arc::new(source.clone()),
            Arc::new(processor),
            IngestionConfig {
                fetch_timeout_ms: 20,
                idle_backoff_ms: 5,
                ..IngestionConfig::default()
            },
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ingests_and_acks_events() {
        let source = InMemoryEventSource::new();
        let events = InMemoryEventRepository::new();
        let ingestor = Arc::new(ingestor(&source, &events));
        assert!(ingestor.reconcile_subjects(vec!["sh.keptn.event.>".to_string()]).await.unwrap());

        let triggered = Event::new("sh.keptn.event.test.triggered", "api", json!({ "project": "sockshop" }));
        source.publish_event(&triggered).unwrap();

        wait_for(|| source.acked_count() == 1).await;
        assert_eq!(events.count("sockshop", EventPhase::Triggered), 1);
        ingestor.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_message_is_acked_and_skipped() {
        let source = InMemoryEventSource::new();
        let events = InMemoryEventRepository::new();
        let ingestor = Arc::new(ingestor(&source, &events));
        ingestor.reconcile_subjects(vec!["sh.keptn.event.>".to_string()]).await.unwrap();

        source.publish("sh.keptn.event.test.triggered", b"{not json".to_vec());

        wait_for(|| source.acked_count() == 1).await;
        assert_eq!(events.count("sockshop", EventPhase::Triggered), 0);
        ingestor.shutdown();
    }

    #[tokio::test]
    async fn test_reconcile_only_restarts_on_change() {
        let source = InMemoryEventSource::new();
        let ingestor = Arc::new(ingestor(&source, &InMemoryEventRepository::new()));

        let subjects = vec!["sh.keptn.event.a.triggered".to_string(), "sh.keptn.event.b.triggered".to_string()];
        assert!(ingestor.reconcile_subjects(subjects.clone()).await.unwrap());
        let mut reordered = subjects.clone();
        reordered.reverse();
        assert!(!ingestor.reconcile_subjects(reordered).await.unwrap());

        assert!(ingestor.reconcile_subjects(vec!["sh.keptn.event.c.triggered".to_string()]).await.unwrap());
        assert_eq!(source.subscriptions(), vec!["sh.keptn.event.c.triggered".to_string()]);
        assert_eq!(ingestor.subjects(), vec!["sh.keptn.event.c.triggered".to_string()]);
        ingestor.shutdown();
    }

    #[tokio::test]
    async fn test_correlation_failure_reaches_event_bus() {
        let source = InMemoryEventSource::new();
        let bus = Arc::new(EventBus::new(16));
        let mut receiver = bus.subscribe();
        let ingestor = Arc::new(ingestor(&source, &InMemoryEventRepository::new()).with_event_bus(bus));
        ingestor.reconcile_subjects(vec!["sh.keptn.event.>".to_string()]).await.unwrap();

        let orphan = Event::new("sh.keptn.event.test.started", "jmeter", json!({ "project": "sockshop" }))
            .with_context("ctx-9")
            .with_triggered_id("missing");
        source.publish_event(&orphan).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), receiver.recv()).await.unwrap().unwrap();
        match received {
            DomainEvent::CorrelationFailed { event_id, keptn_context, .. } => {
                assert_eq!(event_id, orphan.id);
                assert_eq!(keptn_context, "ctx-9");
            }
            other => panic!("unexpected event {other:?}"),
        }
        ingestor.shutdown();
    }
}
