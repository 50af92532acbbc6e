// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Scope
//!
//! Derives the routing scope of an inbound event from its envelope and
//! payload. Two extraction modes are supported:
//!
//! - **Project resolution** ([`EventScope::project_of`]): only `project` is
//!   required. Used by the correlator to pick the event store partition.
//! - **Full scope** ([`EventScope::from_event`]): `project`, `stage`,
//!   `service` and the event type are required. Used wherever a sequence is
//!   addressed.
//!
//! Both are pure functions; nothing is persisted on failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventScope {
    pub project: String,
    pub stage: String,
    pub service: String,
    pub keptn_context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub triggered_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventScopeError {
    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("event payload is not a structured object: {0}")]
    Decode(String),
}

/// Generic view of the payload fields that make up a scope
#[derive(Debug, Default, Deserialize)]
struct ScopeData {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

impl ScopeData {
    fn decode(event: &Event) -> Result<Self, EventScopeError> {
        match &event.data {
            serde_json::Value::Null => Ok(Self::default()),
            serde_json::Value::Object(_) => serde_json::from_value(event.data.clone())
                .map_err(|e| EventScopeError::Decode(e.to_string())),
            other => Err(EventScopeError::Decode(format!("expected an object, found {}", other))),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EventScopeError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(EventScopeError::MissingField(field))
}

impl EventScope {
    /// Full-scope extraction: project, stage, service and type must be set
    pub fn from_event(event: &Event) -> Result<Self, EventScopeError> {
        let data = ScopeData::decode(event)?;

        let project = required(data.project, "project")?;
        let stage = required(data.stage, "stage")?;
        let service = required(data.service, "service")?;
        if event.event_type.is_empty() {
            return Err(EventScopeError::MissingField("type"));
        }

        Ok(Self {
            project,
            stage,
            service,
            keptn_context: event.shkeptncontext.clone(),
            triggered_id: event.triggeredid.clone(),
            event_type: event.event_type.clone(),
            trace_parent: event.traceparent.clone(),
            trace_state: event.tracestate.clone(),
        })
    }

    /// Project-resolution extraction: only the project is required
    pub fn project_of(event: &Event) -> Result<String, EventScopeError> {
        let data = ScopeData::decode(event)?;
        required(data.project, "project")
    }
}
