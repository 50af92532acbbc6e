// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Keptn Event Envelope
//!
//! CloudEvent envelope exchanged between the control plane and the
//! integrations that execute tasks, plus the event type grammar used to
//! route them.
//!
//! Every task follows a three-phase protocol:
//!
//! ```text
//! sh.keptn.event.<task>.triggered   (control plane -> executors)
//! sh.keptn.event.<task>.started     (each executor, triggeredid = triggered.id)
//! sh.keptn.event.<task>.finished    (each executor, triggeredid = triggered.id)
//! ```
//!
//! Sequences use the same grammar qualified by the stage:
//! `sh.keptn.event.<stage>.<sequence>.<phase>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every event type in the protocol
pub const KEPTN_EVENT_PREFIX: &str = "sh.keptn.event.";

/// CloudEvents spec version emitted by the engine
pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";

/// Phase of the triggered -> started -> finished protocol.
///
/// Also used as the partition key of the transient event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    Triggered,
    Started,
    Finished,
}

impl EventPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPhase::Triggered => "triggered",
            EventPhase::Started => "started",
            EventPhase::Finished => "finished",
        }
    }

    /// Resolve the phase from the status suffix of an event type
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let (_, suffix) = event_type.rsplit_once('.')?;
        match suffix {
            "triggered" => Some(EventPhase::Triggered),
            "started" => Some(EventPhase::Started),
            "finished" => Some(EventPhase::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed form of a `sh.keptn.event.[<stage>.]<name>.<phase>` type.
///
/// `stage` is only present for stage-qualified sequence events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeptnEventType {
    pub stage: Option<String>,
    pub name: String,
    pub phase: EventPhase,
}

impl KeptnEventType {
    pub fn parse(event_type: &str) -> Option<Self> {
        let rest = event_type.strip_prefix(KEPTN_EVENT_PREFIX)?;
        let phase = EventPhase::from_event_type(rest)?;
        let body = &rest[..rest.len() - phase.as_str().len() - 1];

        let segments: Vec<&str> = body.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }

        match segments.as_slice() {
            [name] => Some(Self {
                stage: None,
                name: (*name).to_string(),
                phase,
            }),
            [stage, name] => Some(Self {
                stage: Some((*stage).to_string()),
                name: (*name).to_string(),
                phase,
            }),
            _ => None,
        }
    }

    pub fn task(name: impl Into<String>, phase: EventPhase) -> Self {
        Self {
            stage: None,
            name: name.into(),
            phase,
        }
    }

    pub fn sequence(stage: impl Into<String>, name: impl Into<String>, phase: EventPhase) -> Self {
        Self {
            stage: Some(stage.into()),
            name: name.into(),
            phase,
        }
    }

    /// Sequence events carry the stage in their type, task events do not
    pub fn is_sequence_event(&self) -> bool {
        self.stage.is_some()
    }

    /// Same event, different phase of the protocol
    pub fn with_phase(&self, phase: EventPhase) -> Self {
        Self {
            stage: self.stage.clone(),
            name: self.name.clone(),
            phase,
        }
    }
}

impl fmt::Display for KeptnEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{}{}.{}.{}", KEPTN_EVENT_PREFIX, stage, self.name, self.phase),
            None => write!(f, "{}{}.{}", KEPTN_EVENT_PREFIX, self.name, self.phase),
        }
    }
}

/// Outcome reported by an executor in its `.finished` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultType {
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "fail", alias = "failed")]
    Failed,
}

impl ResultType {
    /// failed > warning > pass
    pub fn severity(&self) -> u8 {
        match self {
            ResultType::Pass => 0,
            ResultType::Warning => 1,
            ResultType::Failed => 2,
        }
    }

    pub fn most_severe(self, other: ResultType) -> ResultType {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Pass => "pass",
            ResultType::Warning => "warning",
            ResultType::Failed => "fail",
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status reported by an executor in its `.finished` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    Succeeded,
    Errored,
    Unknown,
}

impl StatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusType::Succeeded => "succeeded",
            StatusType::Errored => "errored",
            StatusType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CloudEvent envelope with an opaque payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    /// Identity of the emitting integration
    pub source: String,

    #[serde(default = "default_spec_version")]
    pub specversion: String,

    /// Correlation ID of the sequence run
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shkeptncontext: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub triggeredid: String,

    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,

    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_spec_version() -> String {
    CLOUD_EVENTS_SPEC_VERSION.to_string()
}

impl Event {
    /// New event with a random ID and the current time
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            specversion: default_spec_version(),
            shkeptncontext: String::new(),
            triggeredid: String::new(),
            time: Utc::now(),
            traceparent: None,
            tracestate: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, keptn_context: impl Into<String>) -> Self {
        self.shkeptncontext = keptn_context.into();
        self
    }

    pub fn with_triggered_id(mut self, triggered_id: impl Into<String>) -> Self {
        self.triggeredid = triggered_id.into();
        self
    }

    pub fn kind(&self) -> Option<KeptnEventType> {
        KeptnEventType::parse(&self.event_type)
    }

    pub fn phase(&self) -> Option<EventPhase> {
        EventPhase::from_event_type(&self.event_type)
    }

    /// Top-level string field of the payload, if present and non-empty
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_event_type() {
        let parsed = KeptnEventType::parse("sh.keptn.event.deployment.triggered").unwrap();
        assert_eq!(parsed.stage, None);
        assert_eq!(parsed.name, "deployment");
        assert_eq!(parsed.phase, EventPhase::Triggered);
        assert!(!parsed.is_sequence_event());
    }

    #[test]
    fn test_parse_sequence_event_type() {
        let parsed = KeptnEventType::parse("sh.keptn.event.dev.delivery.finished").unwrap();
        assert_eq!(parsed.stage.as_deref(), Some("dev"));
        assert_eq!(parsed.name, "delivery");
        assert_eq!(parsed.phase, EventPhase::Finished);
        assert_eq!(parsed.to_string(), "sh.keptn.event.dev.delivery.finished");
    }

    #[test]
    fn test_parse_rejects_unknown_types() {
        assert!(KeptnEventType::parse("sh.keptn.event.deployment.invalidated").is_none());
        assert!(KeptnEventType::parse("io.other.deployment.triggered").is_none());
        assert!(KeptnEventType::parse("sh.keptn.event..triggered").is_none());
        assert!(KeptnEventType::parse("sh.keptn.event.a.b.c.triggered").is_none());
    }

    #[test]
    fn test_with_phase_keeps_name_and_stage() {
        let started = KeptnEventType::parse("sh.keptn.event.test.started").unwrap();
        assert_eq!(
            started.with_phase(EventPhase::Triggered).to_string(),
            "sh.keptn.event.test.triggered"
        );
    }

    #[test]
    fn test_result_severity() {
        assert_eq!(ResultType::Pass.most_severe(ResultType::Warning), ResultType::Warning);
        assert_eq!(ResultType::Failed.most_severe(ResultType::Warning), ResultType::Failed);
        assert_eq!(ResultType::Warning.most_severe(ResultType::Pass), ResultType::Warning);
    }

    #[test]
    fn test_result_accepts_both_failure_spellings() {
        let a: ResultType = serde_json::from_str("\"fail\"").unwrap();
        let b: ResultType = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(a, ResultType::Failed);
        assert_eq!(b, ResultType::Failed);
    }

    #[test]
    fn test_event_deserializes_cloud_event_json() {
        let json = serde_json::json!({
            "id": "e1",
            "type": "sh.keptn.event.deployment.started",
            "source": "helm-service",
            "shkeptncontext": "ctx-1",
            "triggeredid": "t1",
            "data": { "project": "sockshop" }
        });
        let event: Event = serde_json::from_value(json).unwrap();
        assert_eq!(event.triggeredid, "t1");
        assert_eq!(event.specversion, "1.0");
        assert_eq!(event.data_str("project"), Some("sockshop"));
        assert_eq!(event.phase(), Some(EventPhase::Started));
    }
}
