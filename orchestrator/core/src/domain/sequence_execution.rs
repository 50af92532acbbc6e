// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sequence Execution Domain Model
//!
//! The per-run aggregate of a sequence: which task is active, which tasks
//! completed with what outcome, and whether the run is paused.
//!
//! # Architectural Context
//!
//! - **Bounded Context:** Execution Context
//! - **Aggregate Root:** SequenceExecution
//!
//! # Invariants
//!
//! 1. `sequence.tasks` is fixed at creation and never mutated
//! 2. Task *i+1* is only computed once `previous_tasks` holds exactly *i*
//!    entries (strictly sequential progression)
//! 3. A task is finished only when every executor that sent `.started`
//!    has also sent `.finished` (unanimous fan-in)
//! 4. `state_before_pause` is populated only while paused
//!
//! The aggregate performs no locking. Concurrent writers are serialized by
//! the repository (see `UpsertOptions::check_unique_triggered_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::event::{Event, EventPhase, ResultType, StatusType};
use crate::domain::event_scope::EventScope;

pub type Properties = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceExecutionId(pub Uuid);

impl SequenceExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SequenceExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SequenceExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Sequence definition
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,

    /// Static properties from the shipyard, passed to executors verbatim
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: Properties,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub tasks: Vec<Task>,
}

/// Sequence definitions known to the engine, addressed by stage and name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceCatalog {
    #[serde(default)]
    pub sequences: Vec<StageSequence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSequence {
    pub stage: String,
    #[serde(flatten)]
    pub sequence: Sequence,
}

impl SequenceCatalog {
    pub fn new(sequences: Vec<StageSequence>) -> Self {
        Self { sequences }
    }

    pub fn lookup(&self, stage: &str, name: &str) -> Option<&Sequence> {
        self.sequences
            .iter()
            .find(|s| s.stage == stage && s.sequence.name == name)
            .map(|s| &s.sequence)
    }
}

// ============================================================================
// Execution state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceExecutionState {
    Triggered,
    Waiting,
    Started,
    Suspended,
    Paused,
    Finished,
    Cancelled,
    TimedOut,
}

impl SequenceExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Waiting => "waiting",
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timedOut",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::TimedOut)
    }
}

impl fmt::Display for SequenceExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Started/finished signal of one executor for the current task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_type: String,
    /// Executor identity; disambiguates fan-out
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusType>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: Properties,
}

impl TaskEvent {
    pub fn phase(&self) -> Option<EventPhase> {
        EventPhase::from_event_type(&self.event_type)
    }

    fn is_finished_event(&self) -> bool {
        self.phase() == Some(EventPhase::Finished)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionState {
    pub name: String,
    pub triggered_id: String,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl TaskExecutionState {
    /// Every executor that started has finished, and at least one did
    pub fn is_finished(&self) -> bool {
        let started = self
            .events
            .iter()
            .filter(|e| e.phase() == Some(EventPhase::Started))
            .count();
        let finished = self.events.iter().filter(|e| e.is_finished_event()).count();
        started > 0 && started == finished
    }

    pub fn is_failed(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.is_finished_event() && e.result == Some(ResultType::Failed))
    }

    pub fn is_errored(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.is_finished_event() && e.status == Some(StatusType::Errored))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub name: String,
    pub triggered_id: String,
    pub result: ResultType,
    pub status: StatusType,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceExecutionStatus {
    pub state: SequenceExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_before_pause: Option<SequenceExecutionState>,
    #[serde(default)]
    pub previous_tasks: Vec<TaskExecutionResult>,
    #[serde(default)]
    pub current_task: TaskExecutionState,
}

/// Signal sent by a watchdog when a task produced no progress in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceTimeout {
    pub keptn_context: String,
    pub last_event: Event,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SequenceExecutionError {
    #[error("event for triggeredid '{actual}' does not belong to the current task (expected '{expected}')")]
    TriggeredIdMismatch { expected: String, actual: String },

    #[error("sequence execution is already {0}")]
    AlreadyTerminal(SequenceExecutionState),

    #[error("sequence has no task left to start")]
    SequenceExhausted,
}

// ============================================================================
// Aggregate Root: SequenceExecution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceExecution {
    pub id: SequenceExecutionId,
    pub sequence: Sequence,
    pub status: SequenceExecutionStatus,
    pub scope: EventScope,
    #[serde(default)]
    pub input_properties: Properties,
    pub triggered_at: DateTime<Utc>,
}

impl SequenceExecution {
    pub fn new(sequence: Sequence, scope: EventScope, input_properties: Properties) -> Self {
        Self {
            id: SequenceExecutionId::new(),
            sequence,
            status: SequenceExecutionStatus {
                state: SequenceExecutionState::Triggered,
                state_before_pause: None,
                previous_tasks: Vec::new(),
                current_task: TaskExecutionState::default(),
            },
            scope,
            input_properties,
            triggered_at: Utc::now(),
        }
    }

    pub fn can_be_paused(&self) -> bool {
        matches!(
            self.status.state,
            SequenceExecutionState::Started
                | SequenceExecutionState::Waiting
                | SequenceExecutionState::Triggered
        )
    }

    /// Record the state to restore on resume.
    ///
    /// Does not change `state`; callers set it to `Paused` themselves.
    pub fn pause(&mut self) -> bool {
        if !self.can_be_paused() {
            return false;
        }
        self.status.state_before_pause = Some(self.status.state);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.status.state == SequenceExecutionState::Paused
    }

    pub fn resume(&mut self) -> bool {
        if !self.is_paused() {
            return false;
        }
        self.status.state = self
            .status
            .state_before_pause
            .take()
            .unwrap_or(SequenceExecutionState::Started);
        true
    }

    /// The task at index `previous_tasks.len()`, unless the current task failed
    pub fn next_task(&self) -> Option<&Task> {
        if self.status.current_task.is_failed() {
            return None;
        }
        self.sequence.tasks.get(self.status.previous_tasks.len())
    }

    /// Make `task` the current task. The only place `current_task` changes.
    pub fn start_task(&mut self, task: &Task, triggered_id: impl Into<String>) -> Result<(), SequenceExecutionError> {
        if self.status.state.is_terminal() {
            return Err(SequenceExecutionError::AlreadyTerminal(self.status.state));
        }
        self.status.current_task = TaskExecutionState {
            name: task.name.clone(),
            triggered_id: triggered_id.into(),
            events: Vec::new(),
        };
        Ok(())
    }

    /// Record a started/finished signal for the current task.
    ///
    /// Each executor counts once per phase: a redelivered signal from the
    /// same source is skipped and `Ok(false)` returned.
    pub fn append_task_event(&mut self, triggered_id: &str, event: TaskEvent) -> Result<bool, SequenceExecutionError> {
        if self.status.state.is_terminal() {
            return Err(SequenceExecutionError::AlreadyTerminal(self.status.state));
        }
        if self.status.current_task.triggered_id != triggered_id {
            return Err(SequenceExecutionError::TriggeredIdMismatch {
                expected: self.status.current_task.triggered_id.clone(),
                actual: triggered_id.to_string(),
            });
        }
        let events = &mut self.status.current_task.events;
        if events
            .iter()
            .any(|e| e.source == event.source && e.phase() == event.phase())
        {
            return Ok(false);
        }
        events.push(event);
        Ok(true)
    }

    /// Aggregate the finished events of the current task into one result.
    ///
    /// Result: most severe across executors. Status: the last finished
    /// event scanned that reported one. Properties: shallow merge, later
    /// executors win on key collisions.
    pub fn complete_current_task(&mut self) -> (ResultType, StatusType) {
        let mut result = ResultType::Pass;
        let mut status = StatusType::Succeeded;
        let mut properties = Properties::new();

        for event in self.status.current_task.events.iter().filter(|e| e.is_finished_event()) {
            if let Some(r) = event.result {
                result = result.most_severe(r);
            }
            if let Some(s) = event.status {
                status = s;
            }
            for (key, value) in &event.properties {
                properties.insert(key.clone(), value.clone());
            }
        }

        self.status.previous_tasks.push(TaskExecutionResult {
            name: self.status.current_task.name.clone(),
            triggered_id: self.status.current_task.triggered_id.clone(),
            result,
            status,
            properties,
        });

        (result, status)
    }

    /// Whether the current task has already been folded into `previous_tasks`
    pub fn current_task_completed(&self) -> bool {
        let current = &self.status.current_task;
        !current.triggered_id.is_empty()
            && self
                .status
                .previous_tasks
                .last()
                .map(|t| t.triggered_id == current.triggered_id)
                .unwrap_or(false)
    }

    pub fn last_task_execution_result(&self) -> Option<&TaskExecutionResult> {
        self.status.previous_tasks.last()
    }

    /// Payload for the next `.triggered` event: the input properties plus
    /// each completed task's properties under the task's name
    pub fn next_triggered_event_data(&self) -> Properties {
        let mut data = self.input_properties.clone();
        for previous in &self.status.previous_tasks {
            if previous.properties.is_empty() {
                continue;
            }
            let entry = data
                .entry(previous.name.clone())
                .or_insert_with(|| serde_json::Value::Object(Properties::new()));
            if let serde_json::Value::Object(existing) = entry {
                for (key, value) in &previous.properties {
                    existing.insert(key.clone(), value.clone());
                }
            } else {
                *entry = serde_json::Value::Object(previous.properties.clone());
            }
        }
        data
    }

    /// Aggregated outcome over all completed tasks
    pub fn overall_result(&self) -> (ResultType, StatusType) {
        self.status.previous_tasks.iter().fold(
            (ResultType::Pass, StatusType::Succeeded),
            |(result, status), task| {
                let status = if task.status == StatusType::Errored { StatusType::Errored } else { status };
                (result.most_severe(task.result), status)
            },
        )
    }

    pub fn finish(&mut self) {
        self.status.state = SequenceExecutionState::Finished;
        self.status.state_before_pause = None;
    }

    pub fn abort(&mut self) {
        self.status.state = SequenceExecutionState::Cancelled;
        self.status.state_before_pause = None;
    }

    pub fn time_out(&mut self) {
        self.status.state = SequenceExecutionState::TimedOut;
        self.status.state_before_pause = None;
    }
}
