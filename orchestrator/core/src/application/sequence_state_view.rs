// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sequence State Materialized View
//!
//! Observer that folds lifecycle events into [`SequenceState`] documents.
//! The view is best effort: its failures are reported to the hook
//! dispatcher, which logs them, and never roll back the execution that
//! produced the event.
//!
//! Lookups go by `(project, keptn_context)`. Task-level updates use the
//! first match; `SequenceFinished` insists on exactly one.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::event::{EventPhase, ResultType};
use crate::domain::event_scope::{EventScope, EventScopeError};
use crate::domain::lifecycle::{SequenceLifecycleEvent, SequenceLifecycleObserver};
use crate::domain::payload::{EventPayload, InboundEvent};
use crate::domain::repository::{RepositoryError, SequenceStateFilter, SequenceStateRepository};
use crate::domain::sequence_execution::SequenceTimeout;
use crate::domain::sequence_state::{
    SequenceState, SequenceStateEvaluation, SequenceStateEvent, STATE_ABORTED, STATE_FINISHED, STATE_PAUSED,
    STATE_STARTED, STATE_TIMED_OUT, STATE_TRIGGERED, STATE_WAITING,
};

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("no sequence state for context '{keptn_context}' in project '{project}'")]
    NotFound { project: String, keptn_context: String },

    #[error("{count} sequence states for context '{keptn_context}' in project '{project}', expected one")]
    Ambiguous {
        project: String,
        keptn_context: String,
        count: usize,
    },

    #[error(transparent)]
    Scope(#[from] EventScopeError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct SequenceStateMaterializedView {
    repository: Arc<dyn SequenceStateRepository>,
}

impl SequenceStateMaterializedView {
    pub fn new(repository: Arc<dyn SequenceStateRepository>) -> Self {
        Self { repository }
    }

    pub async fn get(&self, project: &str, keptn_context: &str) -> Result<Option<SequenceState>, ViewError> {
        let mut states = self
            .repository
            .find(&SequenceStateFilter::by_context(project, keptn_context))
            .await?;
        Ok(if states.is_empty() { None } else { Some(states.remove(0)) })
    }

    pub async fn list(&self, filter: &SequenceStateFilter) -> Result<Vec<SequenceState>, ViewError> {
        Ok(self.repository.find(filter).await?)
    }

    /// Idempotent: a second trigger for the same context is a no-op
    pub async fn on_sequence_triggered(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        let scope = EventScope::from_event(&inbound.event)?;
        let name = inbound.kind().map(|k| k.name).unwrap_or_else(|| inbound.event.event_type.clone());

        if self.get(&scope.project, &scope.keptn_context).await?.is_some() {
            info!(
                keptn_context = %scope.keptn_context,
                project = %scope.project,
                "Sequence state already exists, ignoring duplicate trigger"
            );
            return Ok(());
        }

        let state = SequenceState::triggered(name, &scope.project, &scope.service, &scope.keptn_context, inbound.event.time);
        match self.repository.create(&state).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::AlreadyExists(_)) => {
                info!(keptn_context = %scope.keptn_context, "Sequence state created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn on_sequence_started(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        self.set_state_from_event(inbound, STATE_STARTED).await
    }

    pub async fn on_sequence_waiting(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        self.set_state_from_event(inbound, STATE_WAITING).await
    }

    /// Triggered, started and finished task events
    pub async fn on_task_event(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        let scope = EventScope::from_event(&inbound.event)?;
        let mut state = self.load_first(&scope.project, &scope.keptn_context).await?;

        if let Some(reason) = &inbound.decode_error {
            warn!(
                keptn_context = %scope.keptn_context,
                event_type = %inbound.event.event_type,
                reason = %reason,
                "Payload did not match its declared type, recording event only"
            );
        }

        let phase = inbound.event.phase();
        let latest = latest_event(inbound);
        let stage = state.stage_mut(&scope.stage);
        stage.latest_event = Some(latest.clone());

        match &inbound.payload {
            EventPayload::DeploymentTriggered(data) => {
                if let Some(image) = &data.image {
                    stage.image = Some(image.clone());
                }
            }
            EventPayload::EvaluationFinished(data) => {
                stage.latest_evaluation = Some(SequenceStateEvaluation {
                    result: data.result.as_str().to_string(),
                    score: data.score,
                });
            }
            _ => {}
        }

        if phase == Some(EventPhase::Finished) && inbound.reported_outcome().0 == Some(ResultType::Failed) {
            stage.latest_failed_event = Some(latest);
        }

        match phase {
            Some(EventPhase::Triggered) if stage.state.is_empty() => stage.state = STATE_TRIGGERED.to_string(),
            Some(EventPhase::Started) => stage.state = STATE_STARTED.to_string(),
            _ => {}
        }
        if phase == Some(EventPhase::Started) && state.state == STATE_TRIGGERED {
            state.state = STATE_STARTED.to_string();
        }

        self.repository.update(&state).await?;
        Ok(())
    }

    pub async fn on_sub_sequence_finished(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        let scope = EventScope::from_event(&inbound.event)?;
        let mut state = self.load_first(&scope.project, &scope.keptn_context).await?;

        let stage = state.stage_mut(&scope.stage);
        stage.latest_event = Some(latest_event(inbound));
        stage.state = STATE_FINISHED.to_string();

        self.repository.update(&state).await?;
        Ok(())
    }

    /// Requires exactly one matching state
    pub async fn on_sequence_finished(&self, inbound: &InboundEvent) -> Result<(), ViewError> {
        let scope = EventScope::from_event(&inbound.event)?;
        let mut states = self
            .repository
            .find(&SequenceStateFilter::by_context(&scope.project, &scope.keptn_context))
            .await?;

        let mut state = match states.len() {
            0 => {
                return Err(ViewError::NotFound {
                    project: scope.project,
                    keptn_context: scope.keptn_context,
                })
            }
            1 => states.remove(0),
            count => {
                return Err(ViewError::Ambiguous {
                    project: scope.project,
                    keptn_context: scope.keptn_context,
                    count,
                })
            }
        };

        state.state = STATE_FINISHED.to_string();
        let stage = state.stage_mut(&scope.stage);
        stage.latest_event = Some(latest_event(inbound));
        stage.state = STATE_FINISHED.to_string();

        self.repository.update(&state).await?;
        info!(keptn_context = %scope.keptn_context, project = %scope.project, "Sequence state finished");
        Ok(())
    }

    pub async fn on_sequence_timed_out(&self, timeout: &SequenceTimeout) -> Result<(), ViewError> {
        let project = EventScope::project_of(&timeout.last_event)?;
        self.set_state(&project, &timeout.keptn_context, STATE_TIMED_OUT).await
    }

    /// Paused, resumed and aborted carry a scope instead of an event
    pub async fn on_scope_transition(&self, scope: &EventScope, new_state: &str) -> Result<(), ViewError> {
        self.set_state(&scope.project, &scope.keptn_context, new_state).await
    }

    async fn set_state_from_event(&self, inbound: &InboundEvent, new_state: &str) -> Result<(), ViewError> {
        let project = EventScope::project_of(&inbound.event)?;
        self.set_state(&project, inbound.keptn_context(), new_state).await
    }

    async fn set_state(&self, project: &str, keptn_context: &str, new_state: &str) -> Result<(), ViewError> {
        let mut state = self.load_first(project, keptn_context).await?;
        debug!(keptn_context = %keptn_context, from = %state.state, to = %new_state, "Sequence state transition");
        state.state = new_state.to_string();
        self.repository.update(&state).await?;
        Ok(())
    }

    async fn load_first(&self, project: &str, keptn_context: &str) -> Result<SequenceState, ViewError> {
        self.get(project, keptn_context).await?.ok_or_else(|| ViewError::NotFound {
            project: project.to_string(),
            keptn_context: keptn_context.to_string(),
        })
    }
}

fn latest_event(inbound: &InboundEvent) -> SequenceStateEvent {
    SequenceStateEvent {
        event_type: inbound.event.event_type.clone(),
        id: inbound.event.id.clone(),
        time: inbound.event.time,
    }
}

#[async_trait]
impl SequenceLifecycleObserver for SequenceStateMaterializedView {
    fn name(&self) -> &str {
        "sequence-state-view"
    }

    async fn on_lifecycle_event(&self, event: &SequenceLifecycleEvent) -> anyhow::Result<()> {
        match event {
            SequenceLifecycleEvent::SequenceTriggered(e) => self.on_sequence_triggered(e).await?,
            SequenceLifecycleEvent::SequenceStarted(e) => self.on_sequence_started(e).await?,
            SequenceLifecycleEvent::SequenceWaiting(e) => self.on_sequence_waiting(e).await?,
            SequenceLifecycleEvent::TaskTriggered(e)
            | SequenceLifecycleEvent::TaskStarted(e)
            | SequenceLifecycleEvent::TaskFinished(e) => self.on_task_event(e).await?,
            SequenceLifecycleEvent::SubSequenceFinished(e) => self.on_sub_sequence_finished(e).await?,
            SequenceLifecycleEvent::SequenceFinished(e) => self.on_sequence_finished(e).await?,
            SequenceLifecycleEvent::SequencePaused(scope) => self.on_scope_transition(scope, STATE_PAUSED).await?,
            SequenceLifecycleEvent::SequenceResumed(scope) => self.on_scope_transition(scope, STATE_STARTED).await?,
            SequenceLifecycleEvent::SequenceAborted(scope) => self.on_scope_transition(scope, STATE_ABORTED).await?,
            SequenceLifecycleEvent::SequenceTimedOut(timeout) => self.on_sequence_timed_out(timeout).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::Event;
    use crate::domain::payload::TaskNames;
    use crate::infrastructure::repositories::InMemorySequenceStateRepository;
    use serde_json::json;

    fn inbound(event_type: &str, data: serde_json::Value) -> InboundEvent {
        let mut payload = json!({ "project": "sockshop", "stage": "dev", "service": "carts" });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), data.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        InboundEvent::decode(
            Event::new(event_type, "test", payload).with_context("ctx-1"),
            &TaskNames::default(),
        )
    }

    async fn triggered_view() -> (SequenceStateMaterializedView, InMemorySequenceStateRepository) {
        let repo = InMemorySequenceStateRepository::new();
        let view = SequenceStateMaterializedView::new(Arc::new(repo.clone()));
        view.on_sequence_triggered(&inbound("sh.keptn.event.dev.delivery.triggered", json!({})))
            .await
            .unwrap();
        (view, repo)
    }

    #[tokio::test]
    async fn test_triggered_creates_state() {
        let (view, _) = triggered_view().await;
        let state = view.get("sockshop", "ctx-1").await.unwrap().unwrap();
        assert_eq!(state.name, "delivery");
        assert_eq!(state.service, "carts");
        assert_eq!(state.state, STATE_TRIGGERED);
        assert!(state.stages.is_empty());
    }

    #[tokio::test]
    async fn test_deployment_image_and_evaluation_recorded() {
        let (view, _) = triggered_view().await;

        view.on_task_event(&inbound(
            "sh.keptn.event.deployment.triggered",
            json!({ "configurationChange": { "values": { "image": "carts:0.13.2" } } }),
        ))
        .await
        .unwrap();
        view.on_task_event(&inbound(
            "sh.keptn.event.evaluation.finished",
            json!({ "result": "pass", "evaluation": { "score": 92.0 } }),
        ))
        .await
        .unwrap();

        let state = view.get("sockshop", "ctx-1").await.unwrap().unwrap();
        let stage = state.stage("dev").unwrap();
        assert_eq!(stage.image.as_deref(), Some("carts:0.13.2"));
        assert_eq!(
            stage.latest_evaluation,
            Some(SequenceStateEvaluation {
                result: "pass".to_string(),
                score: 92.0
            })
        );
        assert_eq!(
            stage.latest_event.as_ref().map(|e| e.event_type.as_str()),
            Some("sh.keptn.event.evaluation.finished")
        );
        assert!(stage.latest_failed_event.is_none());
    }

    #[tokio::test]
    async fn test_failed_task_recorded_as_latest_failed_event() {
        let (view, _) = triggered_view().await;
        let failed = inbound("sh.keptn.event.test.finished", json!({ "result": "fail", "status": "succeeded" }));
        view.on_task_event(&failed).await.unwrap();

        let state = view.get("sockshop", "ctx-1").await.unwrap().unwrap();
        assert_eq!(
            state.stage("dev").unwrap().latest_failed_event.as_ref().map(|e| e.id.clone()),
            Some(failed.event.id.clone())
        );
    }

    #[tokio::test]
    async fn test_task_started_moves_sequence_to_started() {
        let (view, _) = triggered_view().await;
        view.on_task_event(&inbound("sh.keptn.event.deployment.started", json!({})))
            .await
            .unwrap();

        let state = view.get("sockshop", "ctx-1").await.unwrap().unwrap();
        assert_eq!(state.state, STATE_STARTED);
        assert_eq!(state.stage("dev").unwrap().state, STATE_STARTED);
    }

    #[tokio::test]
    async fn test_sequence_finished_requires_state() {
        let repo = InMemorySequenceStateRepository::new();
        let view = SequenceStateMaterializedView::new(Arc::new(repo));
        let err = view
            .on_sequence_finished(&inbound("sh.keptn.event.dev.delivery.finished", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_scope_transitions() {
        let (view, _) = triggered_view().await;
        let scope = EventScope {
            project: "sockshop".to_string(),
            keptn_context: "ctx-1".to_string(),
            ..Default::default()
        };

        let expected = [
            (SequenceLifecycleEvent::SequencePaused(scope.clone()), STATE_PAUSED),
            (SequenceLifecycleEvent::SequenceResumed(scope.clone()), STATE_STARTED),
            (SequenceLifecycleEvent::SequenceAborted(scope.clone()), STATE_ABORTED),
        ];
        for (event, state) in expected {
            view.on_lifecycle_event(&event).await.unwrap();
            assert_eq!(view.get("sockshop", "ctx-1").await.unwrap().unwrap().state, state);
        }
    }
}
