// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Sequence State Repository
//!
//! Read-model documents keyed by `(project, keptn_context)`.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, SequenceStateFilter, SequenceStateRepository};
use crate::domain::sequence_state::SequenceState;

pub struct PostgresSequenceStateRepository {
    pool: PgPool,
}

impl PostgresSequenceStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceStateRepository for PostgresSequenceStateRepository {
    async fn create(&self, state: &SequenceState) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(state)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sequence_states (project, keptn_context, name, state, time, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project, keptn_context) DO NOTHING
            "#,
        )
        .bind(&state.project)
        .bind(&state.keptn_context)
        .bind(&state.name)
        .bind(&state.state)
        .bind(state.time)
        .bind(document)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(format!(
                "sequence state for context '{}' in project '{}'",
                state.keptn_context, state.project
            )));
        }
        Ok(())
    }

    async fn find(&self, filter: &SequenceStateFilter) -> Result<Vec<SequenceState>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM sequence_states
            WHERE project = $1
              AND ($2::text IS NULL OR keptn_context = $2)
              AND ($3::text IS NULL OR name = $3)
              AND ($4::text IS NULL OR state = $4)
            ORDER BY time ASC
            "#,
        )
        .bind(&filter.project)
        .bind(filter.keptn_context.as_deref())
        .bind(filter.name.as_deref())
        .bind(filter.state.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let document: serde_json::Value = row.get("document");
                serde_json::from_value(document).map_err(RepositoryError::from)
            })
            .collect()
    }

    async fn update(&self, state: &SequenceState) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(state)?;

        let result = sqlx::query(
            "UPDATE sequence_states SET name = $3, state = $4, time = $5, document = $6 WHERE project = $1 AND keptn_context = $2",
        )
        .bind(&state.project)
        .bind(&state.keptn_context)
        .bind(&state.name)
        .bind(&state.state)
        .bind(state.time)
        .bind(document)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!(
                "sequence state for context '{}' in project '{}'",
                state.keptn_context, state.project
            )));
        }
        Ok(())
    }

    async fn delete(&self, project: &str, keptn_context: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sequence_states WHERE project = $1 AND keptn_context = $2")
            .bind(project)
            .bind(keptn_context)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
