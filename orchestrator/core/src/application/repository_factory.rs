// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on storage backend configuration.
//! Domain traits stay free of infrastructure; this is the only place that
//! picks an implementation.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::domain::repository::{
    EventRepository, SequenceExecutionRepository, SequenceStateRepository, StorageBackend,
};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::postgres_event::PostgresEventRepository;
use crate::infrastructure::repositories::postgres_sequence_execution::PostgresSequenceExecutionRepository;
use crate::infrastructure::repositories::postgres_sequence_state::PostgresSequenceStateRepository;
use crate::infrastructure::repositories::{
    InMemoryEventRepository, InMemorySequenceExecutionRepository, InMemorySequenceStateRepository,
};

/// Creates an EventRepository implementation based on the configured backend.
///
/// A Postgres backend without a pool falls back to memory.
pub fn create_event_repository(backend: &StorageBackend, pool: Option<PgPool>) -> Arc<dyn EventRepository> {
    match (backend, pool) {
        (StorageBackend::Postgres(_), Some(pool)) => Arc::new(PostgresEventRepository::new(pool)),
        _ => Arc::new(InMemoryEventRepository::new()),
    }
}

/// Creates a SequenceExecutionRepository implementation based on the configured backend
pub fn create_sequence_execution_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Arc<dyn SequenceExecutionRepository> {
    match (backend, pool) {
        (StorageBackend::Postgres(_), Some(pool)) => Arc::new(PostgresSequenceExecutionRepository::new(pool)),
        _ => Arc::new(InMemorySequenceExecutionRepository::new()),
    }
}

/// Creates a SequenceStateRepository implementation based on the configured backend
pub fn create_sequence_state_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Arc<dyn SequenceStateRepository> {
    match (backend, pool) {
        (StorageBackend::Postgres(_), Some(pool)) => Arc::new(PostgresSequenceStateRepository::new(pool)),
        _ => Arc::new(InMemorySequenceStateRepository::new()),
    }
}

/// The three stores the engine runs on
#[derive(Clone)]
pub struct Repositories {
    pub events: Arc<dyn EventRepository>,
    pub sequence_executions: Arc<dyn SequenceExecutionRepository>,
    pub sequence_states: Arc<dyn SequenceStateRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self::with_pool(&StorageBackend::InMemory, None)
    }

    fn with_pool(backend: &StorageBackend, pool: Option<PgPool>) -> Self {
        Self {
            events: create_event_repository(backend, pool.clone()),
            sequence_executions: create_sequence_execution_repository(backend, pool.clone()),
            sequence_states: create_sequence_state_repository(backend, pool),
        }
    }

    /// Connect to the configured backend and make sure its schema exists
    pub async fn connect(backend: &StorageBackend) -> Result<Self> {
        let pool = match backend {
            StorageBackend::InMemory => None,
            StorageBackend::Postgres(config) => {
                let database = Database::new(&config.connection_string, config.max_connections).await?;
                database.ensure_schema().await?;
                info!(max_connections = config.max_connections, "Connected to PostgreSQL");
                Some(database.get_pool().clone())
            }
        };
        Ok(Self::with_pool(backend, pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{Event, EventPhase};
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let repos = Repositories::connect(&StorageBackend::InMemory).await.unwrap();
        let event = Event::new("sh.keptn.event.test.triggered", "api", json!({ "project": "p" }));
        repos.events.insert_event("p", &event, EventPhase::Triggered).await.unwrap();
        assert!(repos.sequence_executions.get(&Default::default()).await.unwrap().is_empty());
    }
}
