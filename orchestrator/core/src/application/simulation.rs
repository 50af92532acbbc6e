// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Simulated Executors
//!
//! Stand-in for the integrations that normally answer task `.triggered`
//! events. Every task the engine dispatches is answered by a fixed number
//! of executors, each sending `.started` and then `.finished` with the
//! configured result. Used by `shipyard simulate` and the end-to-end tests.
//!
//! All executors start before any of them finishes, so the fan-in always
//! waits for the whole group.

use std::sync::Arc;
use std::time::Duration;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::sequence_execution_service::{SequenceExecutionService, CONTROLLER_SOURCE};
use crate::domain::event::{Event, EventPhase, ResultType, StatusType};
use crate::domain::repository::SequenceExecutionFilter;
use crate::infrastructure::event_source::{EventDispatcher, EventSource, EventSourceError};

/// Task (not sequence) `.triggered` events: exactly one token between prefix and phase
pub const TASK_TRIGGERED_SUBJECT: &str = "sh.keptn.event.*.triggered";

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub executors: usize,
    pub result: ResultType,
    pub poll_interval: Duration,
    /// How long to wait for every `.started` to be recorded before finishing anyway
    pub start_timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            executors: 1,
            result: ResultType::Pass,
            poll_interval: Duration::from_millis(20),
            start_timeout: Duration::from_secs(15),
        }
    }
}

pub struct SimulatedExecutors {
    source: Arc<dyn EventSource>,
    outbound: Arc<dyn EventDispatcher>,
    service: Arc<SequenceExecutionService>,
    config: SimulationConfig,
}

impl SimulatedExecutors {
    pub fn new(
        source: Arc<dyn EventSource>,
        outbound: Arc<dyn EventDispatcher>,
        service: Arc<SequenceExecutionService>,
        config: SimulationConfig,
    ) -> Self {
        Self {
            source,
            outbound,
            service,
            config,
        }
    }

    /// Must run after the engine's own subscriptions are in place
    pub async fn subscribe(&self) -> Result<(), EventSourceError> {
        self.source.subscribe(TASK_TRIGGERED_SUBJECT).await
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(executors = self.config.executors, result = %self.config.result, "Simulated executors running");
            loop {
                let batch = tokio::select! {
                    _ = token.cancelled() => break,
                    batch = self.source.fetch(TASK_TRIGGERED_SUBJECT, 10, Duration::from_millis(200)) => batch,
                };

                let messages = match batch {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "Simulated executors stopped fetching");
                        break;
                    }
                };

                for message in messages {
                    let _ = self.source.ack(&message).await;
                    let Ok(event) = serde_json::from_slice::<Event>(&message.payload) else {
                        continue;
                    };
                    if event.source != CONTROLLER_SOURCE {
                        continue;
                    }
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.answer(&event).await {
                            warn!(triggered_id = %event.id, error = %e, "Simulated executor failed");
                        }
                    });
                }
            }
        })
    }

    async fn answer(&self, triggered: &Event) -> anyhow::Result<()> {
        let kind = triggered
            .kind()
            .ok_or_else(|| anyhow::anyhow!("unparseable event type '{}'", triggered.event_type))?;

        for executor in self.executor_names() {
            let started = self.reply(triggered, &kind.with_phase(EventPhase::Started).to_string(), &executor, scope_of(triggered));
            self.outbound.dispatch(&started).await?;
        }

        self.wait_until_started(triggered).await;

        for executor in self.executor_names() {
            let mut data = scope_of(triggered);
            if let Value::Object(map) = &mut data {
                map.insert("result".to_string(), json!(self.config.result.as_str()));
                map.insert("status".to_string(), json!(StatusType::Succeeded.as_str()));
                map.insert(
                    "evaluation".to_string(),
                    json!({ "result": self.config.result.as_str(), "score": score_for(self.config.result) }),
                );
            }
            let finished = self.reply(triggered, &kind.with_phase(EventPhase::Finished).to_string(), &executor, data);
            self.outbound.dispatch(&finished).await?;
        }
        debug!(task = %kind.name, triggered_id = %triggered.id, "Simulated task answered");
        Ok(())
    }

    async fn wait_until_started(&self, triggered: &Event) {
        let filter = SequenceExecutionFilter {
            keptn_context: Some(triggered.shkeptncontext.clone()),
            current_triggered_id: Some(triggered.id.clone()),
            ..Default::default()
        };
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;

        while tokio::time::Instant::now() < deadline {
            let recorded = match self.service.find(&filter).await {
                Ok(executions) => executions
                    .first()
                    .map(|e| {
                        e.status
                            .current_task
                            .events
                            .iter()
                            .filter(|t| t.phase() == Some(EventPhase::Started))
                            .count()
                    })
                    .unwrap_or(0),
                Err(e) => {
                    warn!(error = %e, "Could not read execution while waiting for executors");
                    0
                }
            };
            if recorded >= self.config.executors {
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        warn!(triggered_id = %triggered.id, "Not every simulated executor was recorded as started");
    }

    fn executor_names(&self) -> Vec<String> {
        (1..=self.config.executors.max(1))
            .map(|i| format!("simulated-executor-{i}"))
            .collect()
    }

    fn reply(&self, triggered: &Event, event_type: &str, executor: &str, data: Value) -> Event {
        Event::new(event_type, executor, data)
            .with_context(&triggered.shkeptncontext)
            .with_triggered_id(&triggered.id)
    }
}

fn scope_of(event: &Event) -> Value {
    let mut data = serde_json::Map::new();
    for key in ["project", "stage", "service"] {
        if let Some(value) = event.data_str(key) {
            data.insert(key.to_string(), json!(value));
        }
    }
    Value::Object(data)
}

fn score_for(result: ResultType) -> f64 {
    match result {
        ResultType::Pass => 100.0,
        ResultType::Warning => 75.0,
        ResultType::Failed => 0.0,
    }
}
