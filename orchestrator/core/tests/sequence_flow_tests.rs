// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde_json::json;
use shipyard_core::application::engine::Engine;
use shipyard_core::application::repository_factory::Repositories;
use shipyard_core::application::simulation::{SimulatedExecutors, SimulationConfig};
use shipyard_core::domain::engine_config::{CorrelationConfig, EngineConfigSpec};
use shipyard_core::domain::event::{Event, ResultType};
use shipyard_core::domain::payload::{InboundEvent, TaskNames};
use shipyard_core::domain::repository::{SequenceExecutionFilter, SequenceStateFilter};
use shipyard_core::domain::sequence_execution::{Sequence, SequenceCatalog, SequenceExecutionState, StageSequence, Task};
use shipyard_core::domain::sequence_state::SequenceState;
use shipyard_core::infrastructure::event_bus::DomainEvent;
use shipyard_core::infrastructure::event_source::InMemoryEventSource;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROJECT: &str = "sockshop";

fn spec() -> EngineConfigSpec {
    let mut spec = EngineConfigSpec::default();
    spec.correlation = CorrelationConfig {
        max_retries: 10,
        retry_interval_ms: 50,
    };
    spec.ingestion.fetch_timeout_ms = 50;
    spec.shipyard = SequenceCatalog::new(vec![StageSequence {
        stage: "dev".to_string(),
        sequence: Sequence {
            name: "delivery".to_string(),
            tasks: vec![Task::new("deployment"), Task::new("evaluation")],
        },
    }]);
    spec
}

struct Harness {
    source: InMemoryEventSource,
    engine: Engine,
    token: CancellationToken,
}

async fn harness(executors: usize, result: ResultType) -> Harness {
    let source = InMemoryEventSource::new();
    let engine = Engine::assemble(
        &spec(),
        Repositories::in_memory(),
        Arc::new(source.clone()),
        Arc::new(source.clone()),
    );

    engine
        .ingestor
        .reconcile_subjects(vec!["sh.keptn.event.>".to_string()])
        .await
        .unwrap();

    let simulated = Arc::new(SimulatedExecutors::new(
        Arc::new(source.clone()),
        Arc::new(source.clone()),
        engine.service.clone(),
        SimulationConfig {
            executors,
            result,
            poll_interval: Duration::from_millis(10),
            start_timeout: Duration::from_secs(5),
        },
    ));
    simulated.subscribe().await.unwrap();
    let token = CancellationToken::new();
    simulated.start(token.clone());

    Harness { source, engine, token }
}

fn trigger(keptn_context: &str) -> Event {
    Event::new(
        "sh.keptn.event.dev.delivery.triggered",
        "api-service",
        json!({
            "project": PROJECT,
            "stage": "dev",
            "service": "carts",
            "configurationChange": { "values": { "image": "docker.io/keptnexamples/carts:0.13.1" } }
        }),
    )
    .with_context(keptn_context)
}

async fn wait_for_state(harness: &Harness, keptn_context: &str, expected: &str) -> SequenceState {
    for _ in 0..400 {
        if let Some(state) = harness.engine.view.get(PROJECT, keptn_context).await.unwrap() {
            if state.state == expected {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sequence {keptn_context} never reached state {expected}");
}

#[tokio::test]
async fn test_sequence_runs_to_completion() {
    let harness = harness(1, ResultType::Pass).await;
    harness.source.publish_event(&trigger("ctx-pass")).unwrap();

    let state = wait_for_state(&harness, "ctx-pass", "finished").await;
    assert_eq!(state.name, "delivery");
    assert_eq!(state.service, "carts");
    let stage = state.stages.iter().find(|s| s.name == "dev").unwrap();
    assert_eq!(stage.latest_evaluation.as_ref().unwrap().result, "pass");
    assert!(stage.latest_failed_event.is_none());

    let executions = harness
        .engine
        .service
        .find(&SequenceExecutionFilter {
            keptn_context: Some("ctx-pass".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status.state, SequenceExecutionState::Finished);
    let tasks: Vec<&str> = executions[0]
        .status
        .previous_tasks
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(tasks, vec!["deployment", "evaluation"]);
    harness.token.cancel();
    harness.engine.ingestor.shutdown();
}

#[tokio::test]
async fn test_task_waits_for_all_parallel_executors() {
    let harness = harness(3, ResultType::Pass).await;
    harness.source.publish_event(&trigger("ctx-fanout")).unwrap();

    wait_for_state(&harness, "ctx-fanout", "finished").await;

    let executions = harness
        .engine
        .service
        .find(&SequenceExecutionFilter {
            keptn_context: Some("ctx-fanout".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(executions[0].status.previous_tasks.len(), 2);
    assert_eq!(executions[0].status.previous_tasks[0].result, ResultType::Pass);
    harness.token.cancel();
    harness.engine.ingestor.shutdown();
}

#[tokio::test]
async fn test_failed_task_stops_sequence() {
    let harness = harness(1, ResultType::Failed).await;
    harness.source.publish_event(&trigger("ctx-fail")).unwrap();

    let state = wait_for_state(&harness, "ctx-fail", "finished").await;
    let stage = state.stages.iter().find(|s| s.name == "dev").unwrap();
    assert!(stage.latest_failed_event.is_some());

    let executions = harness
        .engine
        .service
        .find(&SequenceExecutionFilter {
            keptn_context: Some("ctx-fail".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    // Evaluation is never dispatched after a failed deployment
    assert_eq!(executions[0].status.previous_tasks.len(), 1);
    assert_eq!(executions[0].status.previous_tasks[0].result, ResultType::Failed);
    harness.token.cancel();
    harness.engine.ingestor.shutdown();
}

#[tokio::test]
async fn test_lifecycle_events_stream_per_context() {
    let harness = harness(1, ResultType::Pass).await;
    let mut receiver = harness.engine.event_bus.subscribe_context("ctx-stream");
    harness.source.publish_event(&trigger("ctx-stream")).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, DomainEvent::Lifecycle(ref e) if e.name() == "sequence_triggered"));
    assert_eq!(first.keptn_context(), "ctx-stream");
    harness.token.cancel();
    harness.engine.ingestor.shutdown();
}

#[tokio::test]
async fn test_duplicate_trigger_keeps_single_state() {
    let harness = harness(1, ResultType::Pass).await;
    let inbound = InboundEvent::decode(trigger("ctx-dup"), &TaskNames::default());

    harness.engine.view.on_sequence_triggered(&inbound).await.unwrap();
    harness.engine.view.on_sequence_triggered(&inbound).await.unwrap();

    let states = harness
        .engine
        .view
        .list(&SequenceStateFilter::by_context(PROJECT, "ctx-dup"))
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, "triggered");
    harness.token.cancel();
    harness.engine.ingestor.shutdown();
}
