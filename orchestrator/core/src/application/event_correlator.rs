// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Correlator
//!
//! Reconciles the triggered -> started -> finished protocol emitted by any
//! number of executors answering one `.triggered` event, against a store
//! whose reads may lag its writes.
//!
//! | Inbound phase | Prior-phase lookup | Effect |
//! |---------------|--------------------|--------|
//! | triggered | none | insert, no dedup |
//! | started | `.triggered` with `id == triggeredid` | insert started |
//! | finished | `.started` with `triggeredid` | delete started records of the same source; delete the triggered record when the last executor finishes; insert finished |
//!
//! Lookups that find nothing are re-checked on a timer: up to
//! `max_retries` attempts with `retry_interval` between them. The wait is
//! an async sleep, so the worker thread is free while a correlation waits.
//! Exhausting the attempts is terminal; the only retry after that is
//! redelivery by the event source.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::engine_config::CorrelationConfig;
use crate::domain::event::{Event, EventPhase, KeptnEventType};
use crate::domain::event_scope::{EventScope, EventScopeError};
use crate::domain::repository::{EventFilter, EventRepository, RepositoryError};
use crate::infrastructure::metrics as engine_metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval: Duration::from_secs(2),
        }
    }
}

impl From<&CorrelationConfig> for CorrelatorConfig {
    fn from(config: &CorrelationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error(transparent)]
    Scope(#[from] EventScopeError),

    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unsupported event type '{0}'")]
    UnsupportedType(String),

    #[error("no {phase} event '{event_type}' matches triggeredid '{triggered_id}' after {attempts} attempts")]
    NoMatchingEvent {
        phase: EventPhase,
        event_type: String,
        triggered_id: String,
        attempts: u32,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What correlating one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    Triggered,
    Started,
    Finished {
        /// The finishing executor was the last one outstanding and the
        /// triggered record has been removed
        task_completed: bool,
    },
    /// Not a protocol phase; nothing stored
    Ignored,
}

pub struct EventCorrelator {
    repository: Arc<dyn EventRepository>,
    config: CorrelatorConfig,
}

impl EventCorrelator {
    pub fn new(repository: Arc<dyn EventRepository>, config: CorrelatorConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Route by the status suffix of the event type
    pub async fn handle_incoming_event(&self, event: &Event) -> Result<CorrelationOutcome, CorrelationError> {
        match event.phase() {
            Some(EventPhase::Triggered) => self.handle_triggered(event).await.map(|_| CorrelationOutcome::Triggered),
            Some(EventPhase::Started) => self.handle_started(event).await.map(|_| CorrelationOutcome::Started),
            Some(EventPhase::Finished) => self
                .handle_finished(event)
                .await
                .map(|task_completed| CorrelationOutcome::Finished { task_completed }),
            None => {
                debug!(event_type = %event.event_type, "Ignoring event without protocol phase");
                Ok(CorrelationOutcome::Ignored)
            }
        }
    }

    pub async fn handle_triggered(&self, event: &Event) -> Result<(), CorrelationError> {
        let project = EventScope::project_of(event)?;

        self.repository.insert_event(&project, event, EventPhase::Triggered).await?;
        debug!(
            project = %project,
            event_id = %event.id,
            event_type = %event.event_type,
            "Stored triggered event"
        );
        Ok(())
    }

    pub async fn handle_started(&self, event: &Event) -> Result<(), CorrelationError> {
        let project = EventScope::project_of(event)?;
        let triggered_id = required_triggered_id(event)?;
        let triggered_type = prior_phase_type(event, EventPhase::Triggered)?;

        let filter = EventFilter::by_type(&triggered_type).with_id(triggered_id);
        let found = self.find_with_retry(&project, &filter, EventPhase::Triggered).await?;
        if found.is_none() {
            return Err(self.no_match(EventPhase::Triggered, triggered_type, triggered_id));
        }

        self.repository.insert_event(&project, event, EventPhase::Started).await?;
        debug!(
            project = %project,
            triggered_id = %triggered_id,
            source = %event.source,
            "Stored started event"
        );
        Ok(())
    }

    /// Returns whether the task is now complete for every executor
    pub async fn handle_finished(&self, event: &Event) -> Result<bool, CorrelationError> {
        let project = EventScope::project_of(event)?;
        let triggered_id = required_triggered_id(event)?;
        let triggered_type = prior_phase_type(event, EventPhase::Triggered)?;
        let started_type = prior_phase_type(event, EventPhase::Started)?;

        let filter = EventFilter::by_type(&started_type).with_triggered_id(triggered_id);
        let Some(started) = self.find_with_retry(&project, &filter, EventPhase::Started).await? else {
            return Err(self.no_match(EventPhase::Started, started_type, triggered_id));
        };

        // Source, not triggeredid, tells parallel executors apart
        for record in started.iter().filter(|e| e.source == event.source) {
            self.repository.delete_event(&project, &record.id, EventPhase::Started).await?;
        }

        let task_completed = started.len() == 1;
        if task_completed {
            self.delete_triggered(&project, &triggered_type, triggered_id).await?;
        } else {
            debug!(
                triggered_id = %triggered_id,
                outstanding = started.len() - 1,
                "Executors still outstanding for task"
            );
        }

        self.repository.insert_event(&project, event, EventPhase::Finished).await?;
        info!(
            project = %project,
            keptn_context = %event.shkeptncontext,
            triggered_id = %triggered_id,
            source = %event.source,
            task_completed,
            "Correlated finished event"
        );
        Ok(task_completed)
    }

    async fn delete_triggered(&self, project: &str, triggered_type: &str, triggered_id: &str) -> Result<(), CorrelationError> {
        let filter = EventFilter::by_type(triggered_type).with_id(triggered_id);
        match self.repository.get_events(project, &filter, EventPhase::Triggered).await {
            Ok(records) => {
                for record in records {
                    self.repository.delete_event(project, &record.id, EventPhase::Triggered).await?;
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(triggered_id = %triggered_id, "Triggered event already gone for completed task");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up matching events, re-checking after each miss.
    ///
    /// `Ok(None)` once every attempt missed. Store errors other than
    /// not-found end the lookup immediately.
    async fn find_with_retry(
        &self,
        project: &str,
        filter: &EventFilter,
        phase: EventPhase,
    ) -> Result<Option<Vec<Event>>, RepositoryError> {
        for attempt in 1..=self.config.max_retries {
            match self.repository.get_events(project, filter, phase).await {
                Ok(events) if !events.is_empty() => return Ok(Some(events)),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            debug!(
                project = %project,
                phase = %phase,
                attempt,
                max_retries = self.config.max_retries,
                "No matching event yet, retrying"
            );
            engine_metrics::record_correlation_retry();
            tokio::time::sleep(self.config.retry_interval).await;
        }
        Ok(None)
    }

    fn no_match(&self, phase: EventPhase, event_type: String, triggered_id: &str) -> CorrelationError {
        engine_metrics::record_correlation_failure(phase.as_str());
        CorrelationError::NoMatchingEvent {
            phase,
            event_type,
            triggered_id: triggered_id.to_string(),
            attempts: self.config.max_retries,
        }
    }
}

fn required_triggered_id(event: &Event) -> Result<&str, CorrelationError> {
    if event.triggeredid.is_empty() {
        return Err(CorrelationError::MissingField("triggeredid"));
    }
    Ok(&event.triggeredid)
}

/// Same task, earlier phase: `sh.keptn.event.test.finished` -> `sh.keptn.event.test.started`
fn prior_phase_type(event: &Event, phase: EventPhase) -> Result<String, CorrelationError> {
    let kind = KeptnEventType::parse(&event.event_type)
        .ok_or_else(|| CorrelationError::UnsupportedType(event.event_type.clone()))?;
    Ok(kind.with_phase(phase).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryEventRepository;
    use serde_json::json;

    fn correlator(repo: &InMemoryEventRepository) -> EventCorrelator {
        EventCorrelator::new(
            Arc::new(repo.clone()),
            CorrelatorConfig {
                max_retries: 2,
                retry_interval: Duration::from_millis(5),
            },
        )
    }

    fn event(event_type: &str, source: &str) -> Event {
        Event::new(event_type, source, json!({ "project": "sockshop", "stage": "dev", "service": "carts" }))
            .with_context("ctx-1")
    }

    #[test]
    fn test_prior_phase_type() {
        let finished = event("sh.keptn.event.test.finished", "jmeter");
        assert_eq!(
            prior_phase_type(&finished, EventPhase::Started).unwrap(),
            "sh.keptn.event.test.started"
        );
        assert_eq!(
            prior_phase_type(&finished, EventPhase::Triggered).unwrap(),
            "sh.keptn.event.test.triggered"
        );
    }

    #[tokio::test]
    async fn test_unknown_suffix_is_ignored() {
        let repo = InMemoryEventRepository::new();
        let outcome = correlator(&repo)
            .handle_incoming_event(&event("sh.keptn.event.test.invalidated", "x"))
            .await
            .unwrap();
        assert_eq!(outcome, CorrelationOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_missing_project_stores_nothing() {
        let repo = InMemoryEventRepository::new();
        let e = Event::new("sh.keptn.event.test.triggered", "x", json!({ "stage": "dev" }));
        let err = correlator(&repo).handle_triggered(&e).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Scope(EventScopeError::MissingField("project"))));
    }

    #[tokio::test]
    async fn test_started_without_triggered_id_fails_fast() {
        let repo = InMemoryEventRepository::new();
        let err = correlator(&repo)
            .handle_started(&event("sh.keptn.event.test.started", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelationError::MissingField("triggeredid")));
        assert_eq!(repo.count("sockshop", EventPhase::Started), 0);
    }

    #[tokio::test]
    async fn test_finished_without_started_fails() {
        let repo = InMemoryEventRepository::new();
        let c = correlator(&repo);
        let triggered = event("sh.keptn.event.test.triggered", "shipyard-controller");
        c.handle_triggered(&triggered).await.unwrap();

        let finished = event("sh.keptn.event.test.finished", "a").with_triggered_id(&triggered.id);
        let err = c.handle_finished(&finished).await.unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::NoMatchingEvent { phase: EventPhase::Started, attempts: 2, .. }
        ));
        assert_eq!(repo.count("sockshop", EventPhase::Finished), 0);
        assert_eq!(repo.count("sockshop", EventPhase::Triggered), 1);
    }
}
