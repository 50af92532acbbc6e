// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sequence Execution Service
//!
//! Drives [`SequenceExecution`] aggregates from correlated task events and
//! control commands, persists them, and fires the matching lifecycle events.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Collaborators:** `SequenceExecutionRepository`, `LifecycleHooks`
//!
//! Read-modify-write cycles on one sequence run are serialized per
//! `keptn_context` inside this process. Across processes the store's
//! unique-triggered_id check is the only guard.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::lifecycle_hooks::LifecycleHooks;
use crate::domain::event::{Event, EventPhase, KeptnEventType, ResultType, StatusType};
use crate::domain::event_scope::{EventScope, EventScopeError};
use crate::domain::lifecycle::SequenceLifecycleEvent;
use crate::domain::payload::{InboundEvent, TaskNames};
use crate::domain::repository::{
    RepositoryError, SequenceExecutionFilter, SequenceExecutionRepository, UpsertOptions,
};
use crate::domain::sequence_execution::{
    Properties, Sequence, SequenceExecution, SequenceExecutionError, SequenceExecutionId, SequenceExecutionState,
    SequenceTimeout, Task, TaskEvent,
};

/// Source of every event the engine emits
pub const CONTROLLER_SOURCE: &str = "shipyard-controller";

const ACTIVE_STATES: [SequenceExecutionState; 5] = [
    SequenceExecutionState::Triggered,
    SequenceExecutionState::Waiting,
    SequenceExecutionState::Started,
    SequenceExecutionState::Suspended,
    SequenceExecutionState::Paused,
];

/// Payload keys that describe routing rather than task output
const SCOPE_KEYS: [&str; 6] = ["project", "stage", "service", "result", "status", "message"];

/// What the caller should do after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Publish `event` to the task's executors
    DispatchTask { task: Task, event: Event },
    /// Publish the sequence's `.finished` event
    FinishSequence {
        result: ResultType,
        status: StatusType,
        event: Event,
    },
    /// Some executors have not finished yet
    AwaitExecutors,
    /// The run is paused; nothing is dispatched until it is resumed
    Paused,
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceServiceError {
    #[error("sequence execution {0} not found")]
    NotFound(SequenceExecutionId),

    #[error(transparent)]
    Scope(#[from] EventScopeError),

    #[error(transparent)]
    Execution(#[from] SequenceExecutionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{count} active sequence executions own triggered_id '{triggered_id}'")]
    AmbiguousTriggeredId { triggered_id: String, count: usize },
}

/// Result of starting a sequence run
#[derive(Debug, Clone)]
pub struct StartedSequence {
    pub execution: SequenceExecution,
    /// Sequence-level `.started` event to publish
    pub started_event: Event,
}

pub struct SequenceExecutionService {
    repository: Arc<dyn SequenceExecutionRepository>,
    hooks: Arc<LifecycleHooks>,
    tasks: TaskNames,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SequenceExecutionService {
    pub fn new(repository: Arc<dyn SequenceExecutionRepository>, hooks: Arc<LifecycleHooks>, tasks: TaskNames) -> Self {
        Self {
            repository,
            hooks,
            tasks,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn context_lock(&self, keptn_context: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(keptn_context.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_context(&self, keptn_context: &str) {
        let mut locks = self.locks.lock();
        // Only drop the entry when nobody else holds a handle to it
        if locks.get(keptn_context).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(keptn_context);
        }
    }

    pub async fn get(&self, id: SequenceExecutionId) -> Result<SequenceExecution, SequenceServiceError> {
        self.repository
            .get_by_id(id)
            .await?
            .ok_or(SequenceServiceError::NotFound(id))
    }

    pub async fn find(&self, filter: &SequenceExecutionFilter) -> Result<Vec<SequenceExecution>, SequenceServiceError> {
        Ok(self.repository.get(filter).await?)
    }

    /// Create the execution for a sequence-level `.triggered` event.
    ///
    /// The run stays `triggered` until its first task is dispatched with
    /// [`advance`](Self::advance). Returns `None` when the context already
    /// has a run of this sequence in this stage, so a redelivered trigger
    /// starts nothing.
    pub async fn start_sequence(
        &self,
        inbound: &InboundEvent,
        sequence: Sequence,
    ) -> Result<Option<StartedSequence>, SequenceServiceError> {
        let mut scope = EventScope::from_event(&inbound.event)?;
        if scope.keptn_context.is_empty() {
            return Err(EventScopeError::MissingField("shkeptncontext").into());
        }
        // Later `.started`/`.finished` sequence events answer this event
        scope.triggered_id = inbound.event.id.clone();

        let keptn_context = scope.keptn_context.clone();
        self.serialized(&keptn_context, self.start_sequence_locked(inbound, sequence, scope))
            .await
    }

    async fn start_sequence_locked(
        &self,
        inbound: &InboundEvent,
        sequence: Sequence,
        scope: EventScope,
    ) -> Result<Option<StartedSequence>, SequenceServiceError> {
        let existing = self
            .repository
            .get(&SequenceExecutionFilter {
                project: Some(scope.project.clone()),
                stage: Some(scope.stage.clone()),
                keptn_context: Some(scope.keptn_context.clone()),
                name: Some(sequence.name.clone()),
                ..Default::default()
            })
            .await?;
        if let Some(run) = existing.first() {
            debug!(
                keptn_context = %scope.keptn_context,
                sequence = %sequence.name,
                execution_id = %run.id,
                event_id = %inbound.event.id,
                "Sequence already triggered for this context, ignoring trigger"
            );
            return Ok(None);
        }

        let input_properties = inbound.event.data.as_object().cloned().unwrap_or_default();
        let execution = SequenceExecution::new(sequence, scope, input_properties);
        self.repository.upsert(&execution, UpsertOptions::default()).await?;

        info!(
            keptn_context = %execution.scope.keptn_context,
            project = %execution.scope.project,
            stage = %execution.scope.stage,
            sequence = %execution.sequence.name,
            execution_id = %execution.id,
            "Sequence triggered"
        );
        self.hooks
            .dispatch(SequenceLifecycleEvent::SequenceTriggered(inbound.clone()))
            .await;

        let started_event = self.sequence_event(&execution, EventPhase::Started, json!({}));
        self.hooks
            .dispatch(SequenceLifecycleEvent::SequenceStarted(InboundEvent::decode(
                started_event.clone(),
                &self.tasks,
            )))
            .await;

        Ok(Some(StartedSequence {
            execution,
            started_event,
        }))
    }

    /// Run `work` while holding the per-context lock
    async fn serialized<T>(&self, keptn_context: &str, work: impl Future<Output = T>) -> T {
        let lock = self.context_lock(keptn_context);
        let output = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.release_context(keptn_context);
        output
    }

    /// Dispatch the next task, or finish the run when none is left
    pub async fn advance(&self, id: SequenceExecutionId) -> Result<NextAction, SequenceServiceError> {
        let keptn_context = self.get(id).await?.scope.keptn_context;
        self.serialized(&keptn_context, async {
            let mut execution = self.get(id).await?;
            self.advance_locked(&mut execution).await
        })
        .await
    }

    async fn advance_locked(&self, execution: &mut SequenceExecution) -> Result<NextAction, SequenceServiceError> {
        if execution.status.state.is_terminal() {
            return Err(SequenceExecutionError::AlreadyTerminal(execution.status.state).into());
        }
        if execution.is_paused() {
            debug!(keptn_context = %execution.scope.keptn_context, "Sequence paused, not advancing");
            return Ok(NextAction::Paused);
        }

        match execution.next_task().cloned() {
            Some(task) => self.dispatch_task(execution, task).await,
            None => self.finish_sequence(execution).await,
        }
    }

    async fn dispatch_task(&self, execution: &mut SequenceExecution, task: Task) -> Result<NextAction, SequenceServiceError> {
        let triggered_id = Uuid::new_v4().to_string();
        execution.start_task(&task, &triggered_id)?;
        execution.status.state = SequenceExecutionState::Started;

        self.repository
            .upsert(
                execution,
                UpsertOptions {
                    check_unique_triggered_id: true,
                },
            )
            .await?;

        let mut data = execution.next_triggered_event_data();
        insert_scope(&mut data, &execution.scope);
        if !task.properties.is_empty() {
            let entry = data
                .entry(task.name.clone())
                .or_insert_with(|| Value::Object(Properties::new()));
            if let Value::Object(existing) = entry {
                for (key, value) in &task.properties {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }

        let event = Event::new(
            KeptnEventType::task(&task.name, EventPhase::Triggered).to_string(),
            CONTROLLER_SOURCE,
            Value::Object(data),
        )
        .with_id(&triggered_id)
        .with_context(&execution.scope.keptn_context);

        info!(
            keptn_context = %execution.scope.keptn_context,
            task = %task.name,
            triggered_id = %triggered_id,
            "Task triggered"
        );
        self.hooks
            .dispatch(SequenceLifecycleEvent::TaskTriggered(InboundEvent::decode(event.clone(), &self.tasks)))
            .await;

        Ok(NextAction::DispatchTask { task, event })
    }

    async fn finish_sequence(&self, execution: &mut SequenceExecution) -> Result<NextAction, SequenceServiceError> {
        let (result, status) = execution.overall_result();
        execution.finish();
        self.repository.upsert(execution, UpsertOptions::default()).await?;

        let event = self.sequence_event(
            execution,
            EventPhase::Finished,
            json!({ "result": result.as_str(), "status": status.as_str() }),
        );

        info!(
            keptn_context = %execution.scope.keptn_context,
            sequence = %execution.sequence.name,
            result = %result,
            status = %status,
            "Sequence finished"
        );
        self.hooks
            .dispatch(SequenceLifecycleEvent::SequenceFinished(InboundEvent::decode(event.clone(), &self.tasks)))
            .await;

        Ok(NextAction::FinishSequence { result, status, event })
    }

    /// Record an executor's `.started`. `None` when no active run owns the triggeredid.
    pub async fn on_task_started(&self, inbound: &InboundEvent) -> Result<Option<SequenceExecutionId>, SequenceServiceError> {
        self.serialized(inbound.keptn_context(), async {
            let Some(mut execution) = self.find_by_triggered_id(&inbound.event.triggeredid).await? else {
                return Ok(None);
            };

            if !execution.append_task_event(&inbound.event.triggeredid, task_event(inbound))? {
                debug!(
                    triggered_id = %inbound.event.triggeredid,
                    source = %inbound.event.source,
                    "Executor already recorded as started, ignoring redelivery"
                );
                return Ok(Some(execution.id));
            }
            if execution.status.state == SequenceExecutionState::Triggered {
                execution.status.state = SequenceExecutionState::Started;
            }
            self.repository.upsert(&execution, UpsertOptions::default()).await?;

            debug!(
                keptn_context = %execution.scope.keptn_context,
                triggered_id = %inbound.event.triggeredid,
                source = %inbound.event.source,
                "Executor started task"
            );
            self.hooks
                .dispatch(SequenceLifecycleEvent::TaskStarted(inbound.clone()))
                .await;
            Ok(Some(execution.id))
        })
        .await
    }

    /// Record an executor's `.finished`; completes the task once every
    /// started executor has finished. `None` when no active run owns the triggeredid.
    pub async fn on_task_finished(&self, inbound: &InboundEvent) -> Result<Option<NextAction>, SequenceServiceError> {
        self.serialized(inbound.keptn_context(), async {
            match self.find_by_triggered_id(&inbound.event.triggeredid).await? {
                Some(mut execution) => self.finish_task_locked(&mut execution, inbound).await.map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn finish_task_locked(
        &self,
        execution: &mut SequenceExecution,
        inbound: &InboundEvent,
    ) -> Result<NextAction, SequenceServiceError> {
        if !execution.append_task_event(&inbound.event.triggeredid, task_event(inbound))? {
            debug!(
                triggered_id = %inbound.event.triggeredid,
                source = %inbound.event.source,
                "Executor already recorded as finished, ignoring redelivery"
            );
            return Ok(NextAction::AwaitExecutors);
        }
        self.repository.upsert(execution, UpsertOptions::default()).await?;
        self.hooks
            .dispatch(SequenceLifecycleEvent::TaskFinished(inbound.clone()))
            .await;

        if !execution.status.current_task.is_finished() {
            debug!(
                keptn_context = %execution.scope.keptn_context,
                triggered_id = %inbound.event.triggeredid,
                "Waiting for remaining executors"
            );
            return Ok(NextAction::AwaitExecutors);
        }

        let (result, status) = execution.complete_current_task();
        info!(
            keptn_context = %execution.scope.keptn_context,
            task = %execution.status.current_task.name,
            result = %result,
            status = %status,
            "Task completed"
        );
        self.repository.upsert(execution, UpsertOptions::default()).await?;

        if execution.is_paused() {
            return Ok(NextAction::Paused);
        }
        self.advance_locked(execution).await
    }

    /// Pause every active run of the context. Returns how many were paused.
    pub async fn pause(&self, project: &str, keptn_context: &str) -> Result<usize, SequenceServiceError> {
        let paused = self
            .for_each_active(project, keptn_context, |mut execution| async move {
                if !execution.pause() {
                    return Ok(None);
                }
                execution.status.state = SequenceExecutionState::Paused;
                self.repository.upsert(&execution, UpsertOptions::default()).await?;
                self.hooks
                    .dispatch(SequenceLifecycleEvent::SequencePaused(execution.scope.clone()))
                    .await;
                Ok::<_, SequenceServiceError>(Some(()))
            })
            .await?;
        Ok(paused.len())
    }

    /// Resume paused runs of the context. Runs whose current task already
    /// completed while paused advance immediately.
    pub async fn resume(&self, project: &str, keptn_context: &str) -> Result<Vec<NextAction>, SequenceServiceError> {
        self.for_each_active(project, keptn_context, |mut execution| async move {
            if !execution.resume() {
                return Ok(None);
            }
            self.repository.upsert(&execution, UpsertOptions::default()).await?;
            self.hooks
                .dispatch(SequenceLifecycleEvent::SequenceResumed(execution.scope.clone()))
                .await;

            let idle = execution.status.current_task.triggered_id.is_empty() || execution.current_task_completed();
            if idle {
                return self.advance_locked(&mut execution).await.map(Some);
            }
            Ok::<_, SequenceServiceError>(Some(NextAction::AwaitExecutors))
        })
        .await
    }

    /// Cancel every active run of the context. Returns how many were aborted.
    pub async fn abort(&self, project: &str, keptn_context: &str) -> Result<usize, SequenceServiceError> {
        let aborted = self
            .for_each_active(project, keptn_context, |mut execution| async move {
                execution.abort();
                self.repository.upsert(&execution, UpsertOptions::default()).await?;
                info!(keptn_context = %execution.scope.keptn_context, "Sequence aborted");
                self.hooks
                    .dispatch(SequenceLifecycleEvent::SequenceAborted(execution.scope.clone()))
                    .await;
                Ok::<_, SequenceServiceError>(Some(()))
            })
            .await?;
        Ok(aborted.len())
    }

    /// Force the run owning the timed-out task into `timedOut`
    pub async fn time_out(&self, timeout: SequenceTimeout) -> Result<Option<SequenceExecutionId>, SequenceServiceError> {
        // A `.triggered` event is its own task id; later phases point back to it
        let triggered_id = match timeout.last_event.phase() {
            Some(EventPhase::Triggered) => timeout.last_event.id.clone(),
            _ => timeout.last_event.triggeredid.clone(),
        };

        self.serialized(&timeout.keptn_context, async {
            let Some(mut execution) = self.find_by_triggered_id(&triggered_id).await? else {
                return Ok(None);
            };

            execution.time_out();
            self.repository.upsert(&execution, UpsertOptions::default()).await?;
            warn!(
                keptn_context = %timeout.keptn_context,
                triggered_id = %triggered_id,
                "Sequence timed out"
            );
            self.hooks
                .dispatch(SequenceLifecycleEvent::SequenceTimedOut(timeout.clone()))
                .await;
            Ok(Some(execution.id))
        })
        .await
    }

    /// Apply `apply` to each active run of the context, stopping at the first error
    async fn for_each_active<T, F, Fut>(
        &self,
        project: &str,
        keptn_context: &str,
        mut apply: F,
    ) -> Result<Vec<T>, SequenceServiceError>
    where
        F: FnMut(SequenceExecution) -> Fut,
        Fut: Future<Output = Result<Option<T>, SequenceServiceError>>,
    {
        self.serialized(keptn_context, async {
            let filter = SequenceExecutionFilter {
                project: Some(project.to_string()),
                keptn_context: Some(keptn_context.to_string()),
                states: ACTIVE_STATES.to_vec(),
                ..Default::default()
            };

            let mut outputs = Vec::new();
            for execution in self.repository.get(&filter).await? {
                if let Some(output) = apply(execution).await? {
                    outputs.push(output);
                }
            }
            Ok(outputs)
        })
        .await
    }

    async fn find_by_triggered_id(&self, triggered_id: &str) -> Result<Option<SequenceExecution>, SequenceServiceError> {
        if triggered_id.is_empty() {
            return Ok(None);
        }
        let filter = SequenceExecutionFilter {
            current_triggered_id: Some(triggered_id.to_string()),
            states: ACTIVE_STATES.to_vec(),
            ..Default::default()
        };
        let mut matches = self.repository.get(&filter).await?;
        if matches.len() > 1 {
            warn!(triggered_id = %triggered_id, count = matches.len(), "Several executions own one triggered_id");
            return Err(SequenceServiceError::AmbiguousTriggeredId {
                triggered_id: triggered_id.to_string(),
                count: matches.len(),
            });
        }
        Ok(matches.pop())
    }

    /// Sequence-level event answering the run's `.triggered` event
    fn sequence_event(&self, execution: &SequenceExecution, phase: EventPhase, extra: Value) -> Event {
        let mut data = Properties::new();
        insert_scope(&mut data, &execution.scope);
        if let Value::Object(extra) = extra {
            data.extend(extra);
        }
        Event::new(
            KeptnEventType::sequence(&execution.scope.stage, &execution.sequence.name, phase).to_string(),
            CONTROLLER_SOURCE,
            Value::Object(data),
        )
        .with_context(&execution.scope.keptn_context)
        .with_triggered_id(&execution.scope.triggered_id)
    }
}

fn insert_scope(data: &mut Properties, scope: &EventScope) {
    data.insert("project".to_string(), Value::String(scope.project.clone()));
    data.insert("stage".to_string(), Value::String(scope.stage.clone()));
    data.insert("service".to_string(), Value::String(scope.service.clone()));
}

fn task_event(inbound: &InboundEvent) -> TaskEvent {
    let properties = inbound
        .event
        .data
        .as_object()
        .map(|data| {
            data.iter()
                .filter(|(key, _)| !SCOPE_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();
    let (result, status) = inbound.reported_outcome();

    TaskEvent {
        event_type: inbound.event.event_type.clone(),
        source: inbound.event.source.clone(),
        result,
        status,
        time: inbound.event.time,
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemorySequenceExecutionRepository;

    fn service() -> SequenceExecutionService {
        SequenceExecutionService::new(
            Arc::new(InMemorySequenceExecutionRepository::new()),
            Arc::new(LifecycleHooks::new()),
            TaskNames::default(),
        )
    }

    fn sequence() -> Sequence {
        Sequence {
            name: "delivery".to_string(),
            tasks: vec![Task::new("deployment"), Task::new("evaluation")],
        }
    }

    fn trigger() -> InboundEvent {
        InboundEvent::decode(
            Event::new(
                "sh.keptn.event.dev.delivery.triggered",
                "api",
                json!({ "project": "sockshop", "stage": "dev", "service": "carts" }),
            )
            .with_context("ctx-1"),
            &TaskNames::default(),
        )
    }

    fn executor_event(task: &str, phase: &str, triggered_id: &str, source: &str, data: Value) -> InboundEvent {
        let mut payload = json!({ "project": "sockshop", "stage": "dev", "service": "carts" });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), data.as_object()) {
            target.extend(extra.clone());
        }
        InboundEvent::decode(
            Event::new(format!("sh.keptn.event.{}.{}", task, phase), source, payload)
                .with_context("ctx-1")
                .with_triggered_id(triggered_id),
            &TaskNames::default(),
        )
    }

    fn dispatched(action: NextAction) -> Event {
        match action {
            NextAction::DispatchTask { event, .. } => event,
            other => panic!("expected a dispatched task, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_sequence_emits_started_event() {
        let svc = service();
        let trigger = trigger();
        let started = svc.start_sequence(&trigger, sequence()).await.unwrap().unwrap();

        assert_eq!(started.execution.status.state, SequenceExecutionState::Triggered);
        assert_eq!(started.started_event.event_type, "sh.keptn.event.dev.delivery.started");
        assert_eq!(started.started_event.triggeredid, trigger.event.id);
        assert_eq!(started.started_event.source, CONTROLLER_SOURCE);
    }

    #[tokio::test]
    async fn test_full_run_dispatches_tasks_in_order() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();

        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());
        assert_eq!(deployment.event_type, "sh.keptn.event.deployment.triggered");
        assert_eq!(deployment.data["project"], "sockshop");

        svc.on_task_started(&executor_event("deployment", "started", &deployment.id, "helm", json!({})))
            .await
            .unwrap();
        let next = svc
            .on_task_finished(&executor_event(
                "deployment",
                "finished",
                &deployment.id,
                "helm",
                json!({ "result": "pass", "status": "succeeded", "deploymentURI": "http://carts" }),
            ))
            .await
            .unwrap()
            .unwrap();

        let evaluation = dispatched(next);
        assert_eq!(evaluation.event_type, "sh.keptn.event.evaluation.triggered");
        assert_eq!(evaluation.data["deployment"]["deploymentURI"], "http://carts");

        svc.on_task_started(&executor_event("evaluation", "started", &evaluation.id, "lighthouse", json!({})))
            .await
            .unwrap();
        let last = svc
            .on_task_finished(&executor_event(
                "evaluation",
                "finished",
                &evaluation.id,
                "lighthouse",
                json!({ "result": "warning", "evaluation": { "score": 80.0 } }),
            ))
            .await
            .unwrap()
            .unwrap();

        match last {
            NextAction::FinishSequence { result, event, .. } => {
                assert_eq!(result, ResultType::Warning);
                assert_eq!(event.event_type, "sh.keptn.event.dev.delivery.finished");
            }
            other => panic!("expected the sequence to finish, got {:?}", other),
        }

        let execution = svc.get(started.execution.id).await.unwrap();
        assert_eq!(execution.status.state, SequenceExecutionState::Finished);
        assert_eq!(execution.status.previous_tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_task_waits_for_every_started_executor() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());

        for source in ["a", "b"] {
            svc.on_task_started(&executor_event("deployment", "started", &deployment.id, source, json!({})))
                .await
                .unwrap();
        }

        let first = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "a", json!({ "result": "pass" })))
            .await
            .unwrap();
        assert_eq!(first, Some(NextAction::AwaitExecutors));

        let second = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "b", json!({ "result": "pass" })))
            .await
            .unwrap();
        assert!(matches!(second, Some(NextAction::DispatchTask { .. })));
    }

    #[tokio::test]
    async fn test_redelivered_trigger_starts_nothing() {
        let svc = service();
        let trigger = trigger();
        assert!(svc.start_sequence(&trigger, sequence()).await.unwrap().is_some());
        assert!(svc.start_sequence(&trigger, sequence()).await.unwrap().is_none());

        let runs = svc
            .find(&SequenceExecutionFilter {
                keptn_context: Some("ctx-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_finished_keeps_waiting_for_other_executors() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());

        for source in ["a", "b"] {
            svc.on_task_started(&executor_event("deployment", "started", &deployment.id, source, json!({})))
                .await
                .unwrap();
        }
        let finished_a = executor_event("deployment", "finished", &deployment.id, "a", json!({ "result": "pass" }));
        assert_eq!(svc.on_task_finished(&finished_a).await.unwrap(), Some(NextAction::AwaitExecutors));
        assert_eq!(svc.on_task_finished(&finished_a).await.unwrap(), Some(NextAction::AwaitExecutors));

        let execution = svc.get(started.execution.id).await.unwrap();
        assert!(execution.status.previous_tasks.is_empty());
        assert_eq!(execution.status.current_task.events.len(), 3);

        let last = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "b", json!({ "result": "pass" })))
            .await
            .unwrap();
        assert!(matches!(last, Some(NextAction::DispatchTask { task, .. }) if task.name == "evaluation"));
    }

    #[tokio::test]
    async fn test_redelivered_started_does_not_stall_task() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());

        let started_a = executor_event("deployment", "started", &deployment.id, "a", json!({}));
        svc.on_task_started(&started_a).await.unwrap();
        assert_eq!(svc.on_task_started(&started_a).await.unwrap(), Some(started.execution.id));

        let next = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "a", json!({ "result": "pass" })))
            .await
            .unwrap();
        assert!(matches!(next, Some(NextAction::DispatchTask { task, .. }) if task.name == "evaluation"));
    }

    #[tokio::test]
    async fn test_errored_evaluation_without_details_stops_sequence() {
        let svc = service();
        let delivery = Sequence {
            name: "delivery".to_string(),
            tasks: vec![Task::new("deployment"), Task::new("evaluation"), Task::new("release")],
        };
        let started = svc.start_sequence(&trigger(), delivery).await.unwrap().unwrap();

        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());
        svc.on_task_started(&executor_event("deployment", "started", &deployment.id, "helm", json!({})))
            .await
            .unwrap();
        let evaluation = dispatched(
            svc.on_task_finished(&executor_event("deployment", "finished", &deployment.id, "helm", json!({ "result": "pass" })))
                .await
                .unwrap()
                .unwrap(),
        );

        svc.on_task_started(&executor_event("evaluation", "started", &evaluation.id, "lighthouse", json!({})))
            .await
            .unwrap();
        let next = svc
            .on_task_finished(&executor_event(
                "evaluation",
                "finished",
                &evaluation.id,
                "lighthouse",
                json!({ "result": "fail", "status": "errored", "message": "no SLO file" }),
            ))
            .await
            .unwrap();

        assert!(matches!(
            next,
            Some(NextAction::FinishSequence {
                result: ResultType::Failed,
                status: StatusType::Errored,
                ..
            })
        ));
        let execution = svc.get(started.execution.id).await.unwrap();
        assert_eq!(execution.status.previous_tasks[1].result, ResultType::Failed);
        assert_eq!(execution.status.previous_tasks[1].status, StatusType::Errored);
    }

    #[tokio::test]
    async fn test_shared_triggered_id_is_rejected() {
        let repository = Arc::new(InMemorySequenceExecutionRepository::new());
        let svc = SequenceExecutionService::new(repository.clone(), Arc::new(LifecycleHooks::new()), TaskNames::default());

        for _ in 0..2 {
            let mut execution = SequenceExecution::new(
                sequence(),
                EventScope::from_event(&trigger().event).unwrap(),
                Properties::new(),
            );
            execution.start_task(&Task::new("deployment"), "t-shared").unwrap();
            repository.upsert(&execution, UpsertOptions::default()).await.unwrap();
        }

        let err = svc
            .on_task_started(&executor_event("deployment", "started", "t-shared", "helm", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceServiceError::AmbiguousTriggeredId { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_failed_task_finishes_sequence() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());

        svc.on_task_started(&executor_event("deployment", "started", &deployment.id, "helm", json!({})))
            .await
            .unwrap();
        let next = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "helm", json!({ "result": "fail" })))
            .await
            .unwrap();

        assert!(matches!(
            next,
            Some(NextAction::FinishSequence { result: ResultType::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_triggered_id_is_not_ours() {
        let svc = service();
        let outcome = svc
            .on_task_started(&executor_event("deployment", "started", "unknown", "helm", json!({})))
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_pause_holds_completed_task_until_resume() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());
        svc.on_task_started(&executor_event("deployment", "started", &deployment.id, "helm", json!({})))
            .await
            .unwrap();

        assert_eq!(svc.pause("sockshop", "ctx-1").await.unwrap(), 1);

        let next = svc
            .on_task_finished(&executor_event("deployment", "finished", &deployment.id, "helm", json!({ "result": "pass" })))
            .await
            .unwrap();
        assert_eq!(next, Some(NextAction::Paused));

        let resumed = svc.resume("sockshop", "ctx-1").await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert!(matches!(&resumed[0], NextAction::DispatchTask { task, .. } if task.name == "evaluation"));

        let execution = svc.get(started.execution.id).await.unwrap();
        assert_eq!(execution.status.state, SequenceExecutionState::Started);
        assert_eq!(execution.status.state_before_pause, None);
    }

    #[tokio::test]
    async fn test_abort_cancels_run() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        assert_eq!(svc.abort("sockshop", "ctx-1").await.unwrap(), 1);

        let execution = svc.get(started.execution.id).await.unwrap();
        assert_eq!(execution.status.state, SequenceExecutionState::Cancelled);
        assert!(svc.advance(started.execution.id).await.is_err());
    }

    #[tokio::test]
    async fn test_time_out_marks_run() {
        let svc = service();
        let started = svc.start_sequence(&trigger(), sequence()).await.unwrap().unwrap();
        let deployment = dispatched(svc.advance(started.execution.id).await.unwrap());

        let id = svc
            .time_out(SequenceTimeout {
                keptn_context: "ctx-1".to_string(),
                last_event: deployment,
            })
            .await
            .unwrap();

        assert_eq!(id, Some(started.execution.id));
        let execution = svc.get(started.execution.id).await.unwrap();
        assert_eq!(execution.status.state, SequenceExecutionState::TimedOut);
    }
}
