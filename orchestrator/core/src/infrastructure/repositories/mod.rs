// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the store contracts defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve events, executions and sequence states
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! JSONB document tables, one per store:
//! - **PostgresEventRepository** - transient protocol events, per project and phase
//! - **PostgresSequenceExecutionRepository** - sequence execution aggregates
//! - **PostgresSequenceStateRepository** - sequence state read model
//!
//! ## In-Memory Repositories
//!
//! Lock-guarded `HashMap` storage for tests, local runs and `simulate`:
//! - **InMemoryEventRepository**
//! - **InMemorySequenceExecutionRepository**
//! - **InMemorySequenceStateRepository**

pub mod postgres_event;
pub mod postgres_sequence_execution;
pub mod postgres_sequence_state;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::event::{Event, EventPhase};
use crate::domain::repository::{
    EventFilter, EventRepository, RepositoryError, SequenceExecutionFilter, SequenceExecutionRepository,
    SequenceStateFilter, SequenceStateRepository, UpsertOptions,
};
use crate::domain::sequence_execution::{SequenceExecution, SequenceExecutionId};
use crate::domain::sequence_state::SequenceState;

pub use postgres_event::PostgresEventRepository;
pub use postgres_sequence_execution::PostgresSequenceExecutionRepository;
pub use postgres_sequence_state::PostgresSequenceStateRepository;

type EventPartition = (String, EventPhase);

#[derive(Clone, Default)]
pub struct InMemoryEventRepository {
    events: Arc<RwLock<HashMap<EventPartition, Vec<Event>>>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records in one partition
    pub fn count(&self, project: &str, phase: EventPhase) -> usize {
        self.events
            .read()
            .get(&(project.to_string(), phase))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn get_events(&self, project: &str, filter: &EventFilter, phase: EventPhase) -> Result<Vec<Event>, RepositoryError> {
        let events = self.events.read();
        let matching: Vec<Event> = events
            .get(&(project.to_string(), phase))
            .map(|partition| partition.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default();

        if matching.is_empty() {
            return Err(RepositoryError::NotFound(format!(
                "no {} events in project '{}' match {:?}",
                phase, project, filter
            )));
        }
        Ok(matching)
    }

    async fn insert_event(&self, project: &str, event: &Event, phase: EventPhase) -> Result<(), RepositoryError> {
        self.events
            .write()
            .entry((project.to_string(), phase))
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn delete_event(&self, project: &str, event_id: &str, phase: EventPhase) -> Result<(), RepositoryError> {
        if let Some(partition) = self.events.write().get_mut(&(project.to_string(), phase)) {
            partition.retain(|e| e.id != event_id);
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySequenceExecutionRepository {
    executions: Arc<RwLock<HashMap<SequenceExecutionId, SequenceExecution>>>,
}

impl InMemorySequenceExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceExecutionRepository for InMemorySequenceExecutionRepository {
    async fn get(&self, filter: &SequenceExecutionFilter) -> Result<Vec<SequenceExecution>, RepositoryError> {
        let executions = self.executions.read();
        let mut matching: Vec<SequenceExecution> = executions.values().filter(|e| filter.matches(e)).cloned().collect();
        matching.sort_by_key(|e| e.triggered_at);
        Ok(matching)
    }

    async fn get_by_id(&self, id: SequenceExecutionId) -> Result<Option<SequenceExecution>, RepositoryError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn upsert(&self, execution: &SequenceExecution, options: UpsertOptions) -> Result<(), RepositoryError> {
        // Check and write under one lock so concurrent upserts cannot both pass
        let mut executions = self.executions.write();

        let triggered_id = &execution.status.current_task.triggered_id;
        if options.check_unique_triggered_id && !triggered_id.is_empty() {
            let taken = executions
                .values()
                .any(|other| other.id != execution.id && &other.status.current_task.triggered_id == triggered_id);
            if taken {
                return Err(RepositoryError::Conflict(format!(
                    "triggered_id '{}' already belongs to another sequence execution",
                    triggered_id
                )));
            }
        }

        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn delete(&self, id: SequenceExecutionId) -> Result<(), RepositoryError> {
        self.executions.write().remove(&id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySequenceStateRepository {
    states: Arc<RwLock<HashMap<(String, String), SequenceState>>>,
}

impl InMemorySequenceStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn state_key(state: &SequenceState) -> (String, String) {
    (state.project.clone(), state.keptn_context.clone())
}

#[async_trait]
impl SequenceStateRepository for InMemorySequenceStateRepository {
    async fn create(&self, state: &SequenceState) -> Result<(), RepositoryError> {
        let mut states = self.states.write();
        let key = state_key(state);
        if states.contains_key(&key) {
            return Err(RepositoryError::AlreadyExists(format!(
                "sequence state for context '{}' in project '{}'",
                state.keptn_context, state.project
            )));
        }
        states.insert(key, state.clone());
        Ok(())
    }

    async fn find(&self, filter: &SequenceStateFilter) -> Result<Vec<SequenceState>, RepositoryError> {
        let states = self.states.read();
        let mut matching: Vec<SequenceState> = states.values().filter(|s| filter.matches(s)).cloned().collect();
        matching.sort_by_key(|s| s.time);
        Ok(matching)
    }

    async fn update(&self, state: &SequenceState) -> Result<(), RepositoryError> {
        let mut states = self.states.write();
        match states.get_mut(&state_key(state)) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!(
                "sequence state for context '{}' in project '{}'",
                state.keptn_context, state.project
            ))),
        }
    }

    async fn delete(&self, project: &str, keptn_context: &str) -> Result<(), RepositoryError> {
        self.states.write().remove(&(project.to_string(), keptn_context.to_string()));
        Ok(())
    }
}
