// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Processor
//!
//! Entry point for one inbound event: decode the payload once, correlate
//! it against the event store, then route it to the sequence execution
//! service. Events the service asks to publish go to the injected
//! [`EventDispatcher`].
//!
//! | Event | Route |
//! |-------|-------|
//! | `<stage>.<sequence>.triggered` with a catalog entry | start the run, publish `.started`, dispatch the first task |
//! | `<task>.started` | record the executor on its run |
//! | `<task>.finished` | record the executor, complete the task on full fan-in, dispatch what comes next |
//! | anything else | correlation only |

use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::event_correlator::{CorrelationError, CorrelationOutcome, EventCorrelator};
use crate::application::sequence_execution_service::{NextAction, SequenceExecutionService, SequenceServiceError, CONTROLLER_SOURCE};
use crate::domain::event::{Event, EventPhase};
use crate::domain::payload::{InboundEvent, TaskNames};
use crate::domain::sequence_execution::SequenceCatalog;
use crate::infrastructure::event_source::EventDispatcher;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Sequence(#[from] SequenceServiceError),

    #[error("failed to dispatch {event_type}: {reason}")]
    Dispatch { event_type: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub correlation: CorrelationOutcome,
    /// Events published as a consequence
    pub dispatched: usize,
}

pub struct EventProcessor {
    correlator: Arc<EventCorrelator>,
    service: Arc<SequenceExecutionService>,
    catalog: SequenceCatalog,
    dispatcher: Arc<dyn EventDispatcher>,
    tasks: TaskNames,
}

impl EventProcessor {
    pub fn new(
        correlator: Arc<EventCorrelator>,
        service: Arc<SequenceExecutionService>,
        catalog: SequenceCatalog,
        dispatcher: Arc<dyn EventDispatcher>,
        tasks: TaskNames,
    ) -> Self {
        Self {
            correlator,
            service,
            catalog,
            dispatcher,
            tasks,
        }
    }

    pub fn service(&self) -> &Arc<SequenceExecutionService> {
        &self.service
    }

    pub async fn process(&self, event: Event) -> Result<ProcessOutcome, ProcessError> {
        let inbound = InboundEvent::decode(event, &self.tasks);
        let correlation = self.correlator.handle_incoming_event(&inbound.event).await?;

        let Some(kind) = inbound.kind() else {
            return Ok(ProcessOutcome {
                correlation,
                dispatched: 0,
            });
        };

        let mut dispatched = 0;
        match (kind.is_sequence_event(), kind.phase) {
            (true, EventPhase::Triggered) if inbound.event.source != CONTROLLER_SOURCE => {
                let stage = kind.stage.as_deref().unwrap_or_default();
                match self.catalog.lookup(stage, &kind.name) {
                    Some(sequence) => {
                        if let Some(started) = self.service.start_sequence(&inbound, sequence.clone()).await? {
                            self.publish(&started.started_event).await?;
                            dispatched += 1;

                            let action = self.service.advance(started.execution.id).await?;
                            dispatched += self.follow(action).await?;
                        }
                    }
                    None => debug!(stage, sequence = %kind.name, "No sequence definition for trigger, correlating only"),
                }
            }
            (false, EventPhase::Started) => {
                if self.service.on_task_started(&inbound).await?.is_none() {
                    debug!(triggered_id = %inbound.event.triggeredid, "Started event belongs to no active sequence");
                }
            }
            (false, EventPhase::Finished) => match self.service.on_task_finished(&inbound).await? {
                Some(action) => dispatched += self.follow(action).await?,
                None => debug!(triggered_id = %inbound.event.triggeredid, "Finished event belongs to no active sequence"),
            },
            _ => {}
        }

        Ok(ProcessOutcome { correlation, dispatched })
    }

    async fn follow(&self, action: NextAction) -> Result<usize, ProcessError> {
        match action {
            NextAction::DispatchTask { event, .. } | NextAction::FinishSequence { event, .. } => {
                self.publish(&event).await?;
                Ok(1)
            }
            NextAction::AwaitExecutors | NextAction::Paused => Ok(0),
        }
    }

    async fn publish(&self, event: &Event) -> Result<(), ProcessError> {
        self.dispatcher.dispatch(event).await.map_err(|e| {
            warn!(event_type = %event.event_type, error = %e, "Dispatch failed");
            ProcessError::Dispatch {
                event_type: event.event_type.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::event_correlator::CorrelatorConfig;
    use crate::application::lifecycle_hooks::LifecycleHooks;
    use crate::domain::repository::SequenceExecutionFilter;
    use crate::domain::sequence_execution::{Sequence, StageSequence, Task};
    use crate::infrastructure::repositories::{InMemoryEventRepository, InMemorySequenceExecutionRepository};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventDispatcher for Recording {
        async fn dispatch(&self, event: &Event) -> anyhow::Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn processor(dispatcher: Arc<Recording>) -> EventProcessor {
        let catalog = SequenceCatalog::new(vec![StageSequence {
            stage: "dev".to_string(),
            sequence: Sequence {
                name: "delivery".to_string(),
                tasks: vec![Task::new("deployment")],
            },
        }]);
        EventProcessor::new(
            Arc::new(EventCorrelator::new(
                Arc::new(InMemoryEventRepository::new()),
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
            catalog,
            dispatcher,
            TaskNames::default(),
        )
    }

    fn scoped(event_type: &str, source: &str) -> Event {
        Event::new(event_type, source, json!({ "project": "sockshop", "stage": "dev", "service": "carts" }))
            .with_context("ctx-1")
    }

    #[tokio::test]
    async fn test_known_sequence_trigger_dispatches_started_and_first_task() {
        let recording = Arc::new(Recording::default());
        let processor = processor(recording.clone());

        let outcome = processor.process(scoped("sh.keptn.event.dev.delivery.triggered", "api")).await.unwrap();

        assert_eq!(outcome.correlation, CorrelationOutcome::Triggered);
        assert_eq!(outcome.dispatched, 2);
        let types: Vec<String> = recording.events.lock().iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(
            types,
            vec!["sh.keptn.event.dev.delivery.started", "sh.keptn.event.deployment.triggered"]
        );
    }

    #[tokio::test]
    async fn test_redelivered_trigger_runs_sequence_once() {
        let recording = Arc::new(Recording::default());
        let processor = processor(recording.clone());
        let trigger = scoped("sh.keptn.event.dev.delivery.triggered", "api");

        let first = processor.process(trigger.clone()).await.unwrap();
        let again = processor.process(trigger).await.unwrap();

        assert_eq!(first.dispatched, 2);
        assert_eq!(again.dispatched, 0);
        assert_eq!(recording.events.lock().len(), 2);
        let runs = processor
            .service()
            .find(&SequenceExecutionFilter {
                keptn_context: Some("ctx-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sequence_is_only_correlated() {
        let recording = Arc::new(Recording::default());
        let processor = processor(recording.clone());

        let outcome = processor.process(scoped("sh.keptn.event.prod.rollback.triggered", "api")).await.unwrap();

        assert_eq!(outcome.dispatched, 0);
        assert!(recording.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_uncorrelated_started_is_rejected() {
        let recording = Arc::new(Recording::default());
        let processor = processor(recording);

        let err = processor
            .process(scoped("sh.keptn.event.deployment.started", "helm").with_triggered_id("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Correlation(CorrelationError::NoMatchingEvent { .. })));
    }
}
