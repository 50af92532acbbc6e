// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sequence State (read model)
//!
//! Denormalized progress snapshot of one sequence run, kept in sync with the
//! lifecycle hooks for low-latency status queries. It is never the source of
//! truth for sequence progression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_TRIGGERED: &str = "triggered";
pub const STATE_STARTED: &str = "started";
pub const STATE_WAITING: &str = "waiting";
pub const STATE_PAUSED: &str = "paused";
pub const STATE_FINISHED: &str = "finished";
pub const STATE_ABORTED: &str = "aborted";
pub const STATE_TIMED_OUT: &str = "timedOut";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceState {
    pub name: String,
    pub service: String,
    pub project: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "shkeptncontext")]
    pub keptn_context: String,
    pub state: String,
    #[serde(default)]
    pub stages: Vec<SequenceStateStage>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStateStage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_evaluation: Option<SequenceStateEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<SequenceStateEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_failed_event: Option<SequenceStateEvent>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStateEvaluation {
    pub result: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    pub time: DateTime<Utc>,
}

impl SequenceState {
    pub fn triggered(
        name: impl Into<String>,
        project: impl Into<String>,
        service: impl Into<String>,
        keptn_context: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            project: project.into(),
            time,
            keptn_context: keptn_context.into(),
            state: STATE_TRIGGERED.to_string(),
            stages: Vec::new(),
        }
    }

    /// Stage entry by name, appended if the sequence has not reached it yet
    pub fn stage_mut(&mut self, name: &str) -> &mut SequenceStateStage {
        let index = match self.stages.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.stages.push(SequenceStateStage {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }

    pub fn stage(&self, name: &str) -> Option<&SequenceStateStage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mut_creates_once() {
        let mut state = SequenceState::triggered("delivery", "sockshop", "carts", "ctx", Utc::now());
        state.stage_mut("dev").image = Some("carts:1".to_string());
        state.stage_mut("dev").state = STATE_STARTED.to_string();
        state.stage_mut("prod");

        assert_eq!(state.stages.len(), 2);
        assert_eq!(state.stage("dev").unwrap().image.as_deref(), Some("carts:1"));
    }

    #[test]
    fn test_serialized_field_names() {
        let state = SequenceState::triggered("delivery", "sockshop", "carts", "ctx", Utc::now());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["shkeptncontext"], "ctx");
        assert_eq!(json["state"], "triggered");
        assert!(json["stages"].as_array().unwrap().is_empty());
    }
}
