// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod event_source;
pub mod metrics;
pub mod repositories;

pub use event_bus::{DomainEvent, EventBus};
pub use event_source::{EventDispatcher, EventSource, InMemoryEventSource};
