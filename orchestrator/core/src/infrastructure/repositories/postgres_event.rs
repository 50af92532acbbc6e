// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Event Repository
//!
//! Transient store for in-flight protocol events. One table, partitioned
//! logically by `(project, phase)`. The full envelope is kept as JSONB; the
//! filterable fields are duplicated into plain columns.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::event::{Event, EventPhase};
use crate::domain::repository::{EventFilter, EventRepository, RepositoryError};

pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn get_events(&self, project: &str, filter: &EventFilter, phase: EventPhase) -> Result<Vec<Event>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM shipyard_events
            WHERE project = $1
              AND phase = $2
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::text IS NULL OR event_id = $4)
              AND ($5::text IS NULL OR triggered_id = $5)
              AND ($6::text IS NULL OR keptn_context = $6)
              AND ($7::text IS NULL OR stage = $7)
              AND ($8::text IS NULL OR service = $8)
            ORDER BY seq ASC
            "#,
        )
        .bind(project)
        .bind(phase.as_str())
        .bind(filter.event_type.as_deref())
        .bind(filter.id.as_deref())
        .bind(filter.triggered_id.as_deref())
        .bind(filter.keptn_context.as_deref())
        .bind(filter.stage.as_deref())
        .bind(filter.service.as_deref())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(RepositoryError::NotFound(format!(
                "no {} events in project '{}' match {:?}",
                phase, project, filter
            )));
        }

        rows.into_iter()
            .map(|row| {
                let document: serde_json::Value = row.get("document");
                serde_json::from_value(document).map_err(RepositoryError::from)
            })
            .collect()
    }

    async fn insert_event(&self, project: &str, event: &Event, phase: EventPhase) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(event)?;

        sqlx::query(
            r#"
            INSERT INTO shipyard_events (
                project, phase, event_id, event_type, triggered_id, keptn_context, stage, service, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(project)
        .bind(phase.as_str())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.triggeredid)
        .bind(&event.shkeptncontext)
        .bind(event.data_str("stage"))
        .bind(event.data_str("service"))
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert event: {}", e)))?;

        Ok(())
    }

    async fn delete_event(&self, project: &str, event_id: &str, phase: EventPhase) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM shipyard_events WHERE project = $1 AND phase = $2 AND event_id = $3")
            .bind(project)
            .bind(phase.as_str())
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
