// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `shipyard simulate`
//!
//! Runs the engine in-process on an in-memory event source, triggers one
//! sequence and lets simulated executors answer every task it dispatches.
//! Lifecycle transitions are printed as they happen; the final sequence
//! state is printed as JSON.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shipyard_core::application::engine::Engine;
use shipyard_core::application::repository_factory::Repositories;
use shipyard_core::application::simulation::{SimulatedExecutors, SimulationConfig};
use shipyard_core::domain::engine_config::EngineConfigManifest;
use shipyard_core::domain::event::{Event, EventPhase, KeptnEventType, ResultType};
use shipyard_core::domain::lifecycle::SequenceLifecycleEvent;
use shipyard_core::domain::sequence_execution::{Sequence, StageSequence, Task};
use shipyard_core::infrastructure::event_bus::{ContextEventReceiver, DomainEvent, EventBusError};
use shipyard_core::infrastructure::event_source::InMemoryEventSource;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SimulatedResult {
    Pass,
    Warning,
    Fail,
}

impl From<SimulatedResult> for ResultType {
    fn from(result: SimulatedResult) -> Self {
        match result {
            SimulatedResult::Pass => ResultType::Pass,
            SimulatedResult::Warning => ResultType::Warning,
            SimulatedResult::Fail => ResultType::Failed,
        }
    }
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, default_value = "sockshop")]
    pub project: String,

    #[arg(long, default_value = "dev")]
    pub stage: String,

    #[arg(long, default_value = "carts")]
    pub service: String,

    /// Sequence to trigger; a deployment/evaluation sequence is used when the config has none by that name
    #[arg(long, default_value = "delivery")]
    pub sequence: String,

    /// Executors answering each task in parallel
    #[arg(long, default_value_t = 1)]
    pub executors: usize,

    /// Result every executor reports
    #[arg(long, value_enum, default_value = "pass")]
    pub result: SimulatedResult,

    /// Image passed in the trigger's configuration change
    #[arg(long)]
    pub image: Option<String>,

    /// Give up when the sequence has not finished after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

pub async fn execute(args: SimulateArgs, config_override: Option<PathBuf>) -> Result<()> {
    let mut manifest = EngineConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    manifest.validate().context("Configuration validation failed")?;

    let spec = &mut manifest.spec;
    if spec.shipyard.lookup(&args.stage, &args.sequence).is_none() {
        println!(
            "{}",
            format!(
                "No sequence '{}' in stage '{}' configured, using deployment → evaluation",
                args.sequence, args.stage
            )
            .yellow()
        );
        spec.shipyard.sequences.push(StageSequence {
            stage: args.stage.clone(),
            sequence: Sequence {
                name: args.sequence.clone(),
                tasks: vec![Task::new(&spec.tasks.deployment), Task::new(&spec.tasks.evaluation)],
            },
        });
    }

    let repositories = Repositories::connect(&spec.storage).await?;
    let source = InMemoryEventSource::new();
    let engine = Engine::assemble(spec, repositories, Arc::new(source.clone()), Arc::new(source.clone()));

    // Engine subscriptions first: reconciling clears every subscription on the source
    engine.ingestor.reconcile_subjects(spec.ingestion.subjects.clone()).await?;
    let simulated = Arc::new(SimulatedExecutors::new(
        Arc::new(source.clone()),
        Arc::new(source.clone()),
        engine.service.clone(),
        SimulationConfig {
            executors: args.executors.max(1),
            result: args.result.into(),
            ..SimulationConfig::default()
        },
    ));
    simulated.subscribe().await?;
    let executors_token = CancellationToken::new();
    let executors = simulated.start(executors_token.clone());
    let ingestion = engine.ingestor.clone().start();

    let keptn_context = uuid::Uuid::new_v4().to_string();
    let mut updates = engine.event_bus.subscribe_context(keptn_context.clone());
    let trigger = trigger_event(&args, &keptn_context);
    info!(keptn_context = %keptn_context, event_type = %trigger.event_type, "Triggering sequence");
    println!("{} {}", "Triggered".bold(), trigger.event_type);
    println!("  shkeptncontext: {}", keptn_context);
    source.publish_event(&trigger)?;

    let finished = follow(&mut updates, Duration::from_secs(args.timeout_secs)).await;

    executors_token.cancel();
    engine.ingestor.shutdown();
    let _ = tokio::join!(executors, ingestion);

    if !finished {
        bail!("Sequence did not finish within {}s", args.timeout_secs);
    }

    let state = engine
        .view
        .get(&args.project, &keptn_context)
        .await?
        .context("No sequence state recorded")?;
    println!();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn trigger_event(args: &SimulateArgs, keptn_context: &str) -> Event {
    let mut data = json!({
        "project": args.project,
        "stage": args.stage,
        "service": args.service,
    });
    if let (Some(image), Some(map)) = (&args.image, data.as_object_mut()) {
        map.insert("configurationChange".to_string(), json!({ "values": { "image": image } }));
    }

    Event::new(
        KeptnEventType::sequence(&args.stage, &args.sequence, EventPhase::Triggered).to_string(),
        "shipyard-cli",
        data,
    )
    .with_context(keptn_context)
}

/// Print lifecycle updates until the sequence finishes. Returns `false` on timeout.
async fn follow(updates: &mut ContextEventReceiver, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let received = match tokio::time::timeout_at(deadline, updates.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(EventBusError::Lagged(n))) => {
                eprintln!("{}", format!("Missed {} lifecycle updates", n).yellow());
                continue;
            }
            Ok(Err(_)) => return false,
            Err(_) => return false,
        };

        match received {
            DomainEvent::Lifecycle(event) => {
                let detail = match &event {
                    SequenceLifecycleEvent::TaskTriggered(e)
                    | SequenceLifecycleEvent::TaskStarted(e)
                    | SequenceLifecycleEvent::TaskFinished(e) => format!("{} ({})", e.event.event_type, e.event.source),
                    SequenceLifecycleEvent::SequenceFinished(e) => format!(
                        "result={} status={}",
                        e.event.data_str("result").unwrap_or("-"),
                        e.event.data_str("status").unwrap_or("-")
                    ),
                    _ => String::new(),
                };
                println!("  {} {} {}", "→".cyan(), event.name(), detail.dimmed());
                if matches!(
                    event,
                    SequenceLifecycleEvent::SequenceFinished(_)
                        | SequenceLifecycleEvent::SequenceAborted(_)
                        | SequenceLifecycleEvent::SequenceTimedOut(_)
                ) {
                    return true;
                }
            }
            DomainEvent::CorrelationFailed { event_type, reason, .. } => {
                println!("  {} {} {}", "!".yellow(), event_type, reason.dimmed());
            }
        }
    }
}
