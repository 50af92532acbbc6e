// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Engine assembly
//!
//! Wires the stores, the lifecycle observers, the sequence service, the
//! processor and the ingestor from one [`EngineConfigSpec`]. The
//! materialized view is always registered as the first observer.

use std::sync::Arc;
use tracing::info;

use crate::application::event_correlator::{CorrelatorConfig, EventCorrelator};
use crate::application::event_ingestor::EventIngestor;
use crate::application::event_processor::EventProcessor;
use crate::application::lifecycle_hooks::LifecycleHooks;
use crate::application::repository_factory::Repositories;
use crate::application::sequence_execution_service::SequenceExecutionService;
use crate::application::sequence_state_view::SequenceStateMaterializedView;
use crate::domain::engine_config::EngineConfigSpec;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::event_source::{EventDispatcher, EventSource};

pub struct Engine {
    pub repositories: Repositories,
    pub event_bus: Arc<EventBus>,
    pub hooks: Arc<LifecycleHooks>,
    pub view: Arc<SequenceStateMaterializedView>,
    pub service: Arc<SequenceExecutionService>,
    pub processor: Arc<EventProcessor>,
    pub ingestor: Arc<EventIngestor>,
}

impl Engine {
    pub fn assemble(
        spec: &EngineConfigSpec,
        repositories: Repositories,
        source: Arc<dyn EventSource>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let hooks = Arc::new(LifecycleHooks::with_event_bus(event_bus.clone()));
        let view = Arc::new(SequenceStateMaterializedView::new(repositories.sequence_states.clone()));
        hooks.register(view.clone());

        let service = Arc::new(SequenceExecutionService::new(
            repositories.sequence_executions.clone(),
            hooks.clone(),
            spec.tasks.clone(),
        ));
        let correlator = Arc::new(EventCorrelator::new(
            repositories.events.clone(),
            CorrelatorConfig::from(&spec.correlation),
        ));
        let processor = Arc::new(EventProcessor::new(
            correlator,
            service.clone(),
            spec.shipyard.clone(),
            dispatcher,
            spec.tasks.clone(),
        ));
        let ingestor = Arc::new(
            EventIngestor::new(source, processor.clone(), spec.ingestion.clone()).with_event_bus(event_bus.clone()),
        );

        info!(
            sequences = spec.shipyard.sequences.len(),
            subjects = ?spec.ingestion.subjects,
            max_retries = spec.correlation.max_retries,
            "Engine assembled"
        );

        Self {
            repositories,
            event_bus,
            hooks,
            view,
            service,
            processor,
            ingestor,
        }
    }
}
