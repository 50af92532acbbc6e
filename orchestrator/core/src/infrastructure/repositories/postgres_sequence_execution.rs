// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Sequence Execution Repository
//!
//! # Schema
//!
//! The `sequence_executions` table stores the full aggregate as JSONB plus
//! the columns `SequenceExecutionFilter` can address.
//!
//! # Unique triggered_id
//!
//! With `UpsertOptions::check_unique_triggered_id` the upsert runs in a
//! transaction holding an advisory lock on the triggered_id, so two writers
//! claiming the same task cannot both pass the uniqueness check.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{
    RepositoryError, SequenceExecutionFilter, SequenceExecutionRepository, UpsertOptions,
};
use crate::domain::sequence_execution::{SequenceExecution, SequenceExecutionId};

pub struct PostgresSequenceExecutionRepository {
    pool: PgPool,
}

impl PostgresSequenceExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<SequenceExecution, RepositoryError> {
    let document: serde_json::Value = row.get("document");
    Ok(serde_json::from_value(document)?)
}

#[async_trait]
impl SequenceExecutionRepository for PostgresSequenceExecutionRepository {
    async fn get(&self, filter: &SequenceExecutionFilter) -> Result<Vec<SequenceExecution>, RepositoryError> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT document FROM sequence_executions
            WHERE ($1::text IS NULL OR project = $1)
              AND ($2::text IS NULL OR stage = $2)
              AND ($3::text IS NULL OR service = $3)
              AND ($4::text IS NULL OR keptn_context = $4)
              AND ($5::text IS NULL OR current_triggered_id = $5)
              AND ($6::text IS NULL OR name = $6)
              AND (cardinality($7::text[]) = 0 OR state = ANY($7))
            ORDER BY triggered_at ASC
            "#,
        )
        .bind(filter.project.as_deref())
        .bind(filter.stage.as_deref())
        .bind(filter.service.as_deref())
        .bind(filter.keptn_context.as_deref())
        .bind(filter.current_triggered_id.as_deref())
        .bind(filter.name.as_deref())
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }

    async fn get_by_id(&self, id: SequenceExecutionId) -> Result<Option<SequenceExecution>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM sequence_executions WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode).transpose()
    }

    async fn upsert(&self, execution: &SequenceExecution, options: UpsertOptions) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(execution)?;
        let triggered_id = &execution.status.current_task.triggered_id;

        let mut tx = self.pool.begin().await?;

        if options.check_unique_triggered_id && !triggered_id.is_empty() {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(triggered_id)
                .execute(&mut *tx)
                .await?;

            let owner = sqlx::query(
                "SELECT id FROM sequence_executions WHERE current_triggered_id = $1 AND id <> $2 LIMIT 1",
            )
            .bind(triggered_id)
            .bind(execution.id.0)
            .fetch_optional(&mut *tx)
            .await?;

            if owner.is_some() {
                return Err(RepositoryError::Conflict(format!(
                    "triggered_id '{}' already belongs to another sequence execution",
                    triggered_id
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO sequence_executions (
                id, project, stage, service, keptn_context, name, state, current_triggered_id, triggered_at, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                current_triggered_id = EXCLUDED.current_triggered_id,
                document = EXCLUDED.document
            "#,
        )
        .bind(execution.id.0)
        .bind(&execution.scope.project)
        .bind(&execution.scope.stage)
        .bind(&execution.scope.service)
        .bind(&execution.scope.keptn_context)
        .bind(&execution.sequence.name)
        .bind(execution.status.state.as_str())
        .bind(triggered_id)
        .bind(execution.triggered_at)
        .bind(document)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save sequence execution: {}", e)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: SequenceExecutionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sequence_executions WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
