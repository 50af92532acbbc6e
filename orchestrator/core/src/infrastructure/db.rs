// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL repository implementations.
//!
//! Only needed when `spec.storage.backend` is `postgres`; the in-memory
//! backend never opens a pool.

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Tables are JSONB documents plus the columns the stores filter on
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS shipyard_events (
        seq           BIGSERIAL PRIMARY KEY,
        project       TEXT NOT NULL,
        phase         TEXT NOT NULL,
        event_id      TEXT NOT NULL,
        event_type    TEXT NOT NULL,
        triggered_id  TEXT NOT NULL DEFAULT '',
        keptn_context TEXT NOT NULL DEFAULT '',
        stage         TEXT,
        service       TEXT,
        document      JSONB NOT NULL,
        inserted_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS shipyard_events_lookup ON shipyard_events (project, phase, event_type, triggered_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sequence_executions (
        id                   UUID PRIMARY KEY,
        project              TEXT NOT NULL,
        stage                TEXT NOT NULL,
        service              TEXT NOT NULL,
        keptn_context        TEXT NOT NULL,
        name                 TEXT NOT NULL,
        state                TEXT NOT NULL,
        current_triggered_id TEXT NOT NULL DEFAULT '',
        triggered_at         TIMESTAMPTZ NOT NULL,
        document             JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS sequence_executions_triggered_id ON sequence_executions (current_triggered_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sequence_states (
        project       TEXT NOT NULL,
        keptn_context TEXT NOT NULL,
        name          TEXT NOT NULL,
        state         TEXT NOT NULL,
        time          TIMESTAMPTZ NOT NULL,
        document      JSONB NOT NULL,
        PRIMARY KEY (project, keptn_context)
    )
    "#,
];

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    /// Create missing tables and indexes. Safe to run on every start.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Database schema ensured");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
