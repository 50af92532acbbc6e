// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Typed Event Payloads
//!
//! Payloads arrive as opaque JSON. They are decoded once at ingestion into an
//! [`EventPayload`] keyed by the declared event type, so downstream consumers
//! match on a variant instead of probing untyped maps.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Anti-corruption boundary between wire payloads and domain logic

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::event::{Event, EventPhase, KeptnEventType, ResultType, StatusType};

/// Names of the tasks whose payloads carry view-relevant data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNames {
    #[serde(default = "default_deployment_task")]
    pub deployment: String,
    #[serde(default = "default_evaluation_task")]
    pub evaluation: String,
}

fn default_deployment_task() -> String {
    "deployment".to_string()
}

fn default_evaluation_task() -> String {
    "evaluation".to_string()
}

impl Default for TaskNames {
    fn default() -> Self {
        Self {
            deployment: default_deployment_task(),
            evaluation: default_evaluation_task(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentTriggeredData {
    /// `configurationChange.values.image`
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFinishedData {
    pub result: ResultType,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskFinishedData {
    pub result: Option<ResultType>,
    pub status: Option<StatusType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    DeploymentTriggered(DeploymentTriggeredData),
    EvaluationFinished(EvaluationFinishedData),
    TaskFinished(TaskFinishedData),
    Generic(serde_json::Value),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {event_type} payload: {reason}")]
    Malformed { event_type: String, reason: String },
}

// Wire shapes. Unknown fields are ignored.

#[derive(Deserialize)]
struct WireDeploymentTriggered {
    #[serde(rename = "configurationChange", default)]
    configuration_change: Option<WireConfigurationChange>,
}

#[derive(Deserialize)]
struct WireConfigurationChange {
    #[serde(default)]
    values: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct WireTaskFinished {
    #[serde(default)]
    result: Option<ResultType>,
    #[serde(default)]
    status: Option<StatusType>,
}

#[derive(Deserialize)]
struct WireEvaluationFinished {
    #[serde(default)]
    result: Option<ResultType>,
    #[serde(default)]
    evaluation: Option<WireEvaluationDetails>,
}

#[derive(Deserialize)]
struct WireEvaluationDetails {
    #[serde(default)]
    result: Option<ResultType>,
    #[serde(default)]
    score: f64,
}

impl EventPayload {
    /// Decode `data` according to the declared event type.
    ///
    /// Types without a dedicated shape decode to [`EventPayload::Generic`].
    pub fn decode(kind: Option<&KeptnEventType>, data: &serde_json::Value, tasks: &TaskNames) -> Result<Self, PayloadError> {
        let Some(kind) = kind else {
            return Ok(EventPayload::Generic(data.clone()));
        };
        if kind.is_sequence_event() {
            return Ok(EventPayload::Generic(data.clone()));
        }

        match kind.phase {
            EventPhase::Triggered if kind.name == tasks.deployment => {
                Self::decode_deployment_triggered(kind, data)
            }
            EventPhase::Finished if kind.name == tasks.evaluation => {
                Self::decode_evaluation_finished(kind, data)
            }
            EventPhase::Finished => Self::decode_task_finished(kind, data),
            _ => Ok(EventPayload::Generic(data.clone())),
        }
    }

    fn decode_deployment_triggered(kind: &KeptnEventType, data: &serde_json::Value) -> Result<Self, PayloadError> {
        let wire: WireDeploymentTriggered = from_value(kind, data)?;
        let image = wire
            .configuration_change
            .and_then(|c| c.values)
            .and_then(|values| values.get("image").and_then(|v| v.as_str()).map(str::to_string))
            .filter(|image| !image.is_empty());
        Ok(EventPayload::DeploymentTriggered(DeploymentTriggeredData { image }))
    }

    fn decode_evaluation_finished(kind: &KeptnEventType, data: &serde_json::Value) -> Result<Self, PayloadError> {
        let wire: WireEvaluationFinished = from_value(kind, data)?;
        let evaluation = wire.evaluation.ok_or_else(|| PayloadError::Malformed {
            event_type: kind.to_string(),
            reason: "missing 'evaluation' section".to_string(),
        })?;
        let result = wire
            .result
            .or(evaluation.result)
            .ok_or_else(|| PayloadError::Malformed {
                event_type: kind.to_string(),
                reason: "missing evaluation result".to_string(),
            })?;
        Ok(EventPayload::EvaluationFinished(EvaluationFinishedData {
            result,
            score: evaluation.score,
        }))
    }

    fn decode_task_finished(kind: &KeptnEventType, data: &serde_json::Value) -> Result<Self, PayloadError> {
        let wire: WireTaskFinished = from_value(kind, data)?;
        Ok(EventPayload::TaskFinished(TaskFinishedData {
            result: wire.result,
            status: wire.status,
        }))
    }

    /// Result reported by a finished event, whichever shape it was decoded to
    pub fn result(&self) -> Option<ResultType> {
        match self {
            EventPayload::EvaluationFinished(d) => Some(d.result),
            EventPayload::TaskFinished(d) => d.result,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusType> {
        match self {
            EventPayload::TaskFinished(d) => d.status,
            _ => None,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(kind: &KeptnEventType, data: &serde_json::Value) -> Result<T, PayloadError> {
    if !data.is_object() {
        return Err(PayloadError::Malformed {
            event_type: kind.to_string(),
            reason: "payload is not an object".to_string(),
        });
    }
    serde_json::from_value(data.clone()).map_err(|e| PayloadError::Malformed {
        event_type: kind.to_string(),
        reason: e.to_string(),
    })
}

/// An event as seen after ingestion: envelope, parsed type and decoded payload.
///
/// A payload that fails its typed decode is kept as [`EventPayload::Generic`]
/// and the failure recorded in `decode_error`; ingestion never stops on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event: Event,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

impl InboundEvent {
    pub fn decode(event: Event, tasks: &TaskNames) -> Self {
        let kind = event.kind();
        match EventPayload::decode(kind.as_ref(), &event.data, tasks) {
            Ok(payload) => Self {
                event,
                payload,
                decode_error: None,
            },
            Err(e) => Self {
                payload: EventPayload::Generic(event.data.clone()),
                event,
                decode_error: Some(e.to_string()),
            },
        }
    }

    pub fn kind(&self) -> Option<KeptnEventType> {
        self.event.kind()
    }

    pub fn keptn_context(&self) -> &str {
        &self.event.shkeptncontext
    }

    /// Result and status as reported on the wire, whether or not the typed
    /// decode succeeded. A top-level `result` wins over the typed payload's.
    pub fn reported_outcome(&self) -> (Option<ResultType>, Option<StatusType>) {
        let field = |key: &str| self.event.data.get(key).cloned();
        let result = field("result")
            .and_then(|v| serde_json::from_value::<ResultType>(v).ok())
            .or_else(|| self.payload.result());
        let status = field("status")
            .and_then(|v| serde_json::from_value::<StatusType>(v).ok())
            .or_else(|| self.payload.status());
        (result, status)
    }
}
