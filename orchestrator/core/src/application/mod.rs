// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod engine;
pub mod event_correlator;
pub mod event_ingestor;
pub mod event_processor;
pub mod lifecycle_hooks;
pub mod repository_factory;
pub mod sequence_execution_service;
pub mod sequence_state_view;
pub mod simulation;

// Re-export use cases for convenience
pub use engine::Engine;
pub use event_correlator::{CorrelationError, CorrelationOutcome, CorrelatorConfig, EventCorrelator};
pub use event_ingestor::EventIngestor;
pub use event_processor::{EventProcessor, ProcessError, ProcessOutcome};
pub use lifecycle_hooks::LifecycleHooks;
pub use repository_factory::Repositories;
pub use sequence_execution_service::{NextAction, SequenceExecutionService, SequenceServiceError};
pub use sequence_state_view::{SequenceStateMaterializedView, ViewError};
pub use simulation::{SimulatedExecutors, SimulationConfig};
