// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts consumed by the engine. Interfaces live in the
//! domain layer and are implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Stores | Implementations |
//! |-------|--------|----------------|
//! | `EventRepository` | transient triggered/started/finished events | `InMemoryEventRepository`, `PostgresEventRepository` |
//! | `SequenceExecutionRepository` | `SequenceExecution` | `InMemorySequenceExecutionRepository`, `PostgresSequenceExecutionRepository` |
//! | `SequenceStateRepository` | `SequenceState` | `InMemorySequenceStateRepository`, `PostgresSequenceStateRepository` |
//!
//! ## Concurrency contract
//!
//! The state machine performs no locking. Implementations of
//! `SequenceExecutionRepository::upsert` must reject a write that would give
//! two executions the same active `triggered_id` when
//! `UpsertOptions::check_unique_triggered_id` is set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::event::{Event, EventPhase};
use crate::domain::sequence_execution::{SequenceExecution, SequenceExecutionId, SequenceExecutionState};
use crate::domain::sequence_state::SequenceState;

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    InMemory,
    Postgres(PostgresConfig),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

// ============================================================================
// Event store
// ============================================================================

/// Filter over stored events. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub id: Option<String>,
    pub triggered_id: Option<String>,
    pub stage: Option<String>,
    pub service: Option<String>,
    pub keptn_context: Option<String>,
}

impl EventFilter {
    pub fn by_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_triggered_id(mut self, triggered_id: impl Into<String>) -> Self {
        self.triggered_id = Some(triggered_id.into());
        self
    }

    pub fn with_keptn_context(mut self, keptn_context: impl Into<String>) -> Self {
        self.keptn_context = Some(keptn_context.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        fn eq(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                Some(expected) => actual == Some(expected.as_str()),
                None => true,
            }
        }

        eq(&self.event_type, Some(&event.event_type))
            && eq(&self.id, Some(&event.id))
            && eq(&self.triggered_id, Some(&event.triggeredid))
            && eq(&self.keptn_context, Some(&event.shkeptncontext))
            && eq(&self.stage, event.data_str("stage"))
            && eq(&self.service, event.data_str("service"))
    }
}

/// Transient store of in-flight protocol events, partitioned by project and phase
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Matching events; `RepositoryError::NotFound` when there are none
    async fn get_events(&self, project: &str, filter: &EventFilter, phase: EventPhase) -> Result<Vec<Event>, RepositoryError>;

    /// Insert without deduplication
    async fn insert_event(&self, project: &str, event: &Event, phase: EventPhase) -> Result<(), RepositoryError>;

    /// Delete every stored record with this ID in the given phase
    async fn delete_event(&self, project: &str, event_id: &str, phase: EventPhase) -> Result<(), RepositoryError>;
}

// ============================================================================
// Sequence execution store
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceExecutionFilter {
    pub project: Option<String>,
    pub stage: Option<String>,
    pub service: Option<String>,
    pub keptn_context: Option<String>,
    /// Matches the `triggered_id` of the active task
    pub current_triggered_id: Option<String>,
    pub name: Option<String>,
    /// Empty matches every state
    pub states: Vec<SequenceExecutionState>,
}

impl SequenceExecutionFilter {
    pub fn matches(&self, execution: &SequenceExecution) -> bool {
        fn eq(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().map(|e| e == actual).unwrap_or(true)
        }

        eq(&self.project, &execution.scope.project)
            && eq(&self.stage, &execution.scope.stage)
            && eq(&self.service, &execution.scope.service)
            && eq(&self.keptn_context, &execution.scope.keptn_context)
            && eq(&self.current_triggered_id, &execution.status.current_task.triggered_id)
            && eq(&self.name, &execution.sequence.name)
            && (self.states.is_empty() || self.states.contains(&execution.status.state))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Reject the write if another execution already owns the same active triggered_id
    pub check_unique_triggered_id: bool,
}

#[async_trait]
pub trait SequenceExecutionRepository: Send + Sync {
    async fn get(&self, filter: &SequenceExecutionFilter) -> Result<Vec<SequenceExecution>, RepositoryError>;

    async fn get_by_id(&self, id: SequenceExecutionId) -> Result<Option<SequenceExecution>, RepositoryError>;

    /// Create or replace. See [`UpsertOptions`].
    async fn upsert(&self, execution: &SequenceExecution, options: UpsertOptions) -> Result<(), RepositoryError>;

    async fn delete(&self, id: SequenceExecutionId) -> Result<(), RepositoryError>;
}

// ============================================================================
// Sequence state store (materialized view)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceStateFilter {
    pub project: String,
    pub keptn_context: Option<String>,
    pub name: Option<String>,
    pub state: Option<String>,
}

impl SequenceStateFilter {
    pub fn by_context(project: impl Into<String>, keptn_context: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            keptn_context: Some(keptn_context.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, state: &SequenceState) -> bool {
        state.project == self.project
            && self.keptn_context.as_deref().map(|c| c == state.keptn_context).unwrap_or(true)
            && self.name.as_deref().map(|n| n == state.name).unwrap_or(true)
            && self.state.as_deref().map(|s| s == state.state).unwrap_or(true)
    }
}

#[async_trait]
pub trait SequenceStateRepository: Send + Sync {
    /// `RepositoryError::AlreadyExists` if (project, keptn_context) is taken
    async fn create(&self, state: &SequenceState) -> Result<(), RepositoryError>;

    async fn find(&self, filter: &SequenceStateFilter) -> Result<Vec<SequenceState>, RepositoryError>;

    /// Replace the document keyed by (project, keptn_context)
    async fn update(&self, state: &SequenceState) -> Result<(), RepositoryError>;

    async fn delete(&self, project: &str, keptn_context: &str) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => RepositoryError::Conflict(db.message().to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_filter_matches_payload_scope() {
        let event = Event::new(
            "sh.keptn.event.deployment.started",
            "helm-service",
            json!({ "project": "sockshop", "stage": "dev", "service": "carts" }),
        )
        .with_triggered_id("t1");

        assert!(EventFilter::by_type("sh.keptn.event.deployment.started")
            .with_triggered_id("t1")
            .matches(&event));

        let mut filter = EventFilter::by_type("sh.keptn.event.deployment.started");
        filter.stage = Some("prod".to_string());
        assert!(!filter.matches(&event));

        assert!(!EventFilter::default().with_triggered_id("t2").matches(&event));
    }
}
