// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lifecycle Hooks
//!
//! Registry of [`SequenceLifecycleObserver`]s. Every transition of a
//! sequence run is dispatched to each observer in registration order and
//! then published on the [`EventBus`] for streaming subscribers.
//!
//! Dispatch is best effort: an observer error is logged and counted, and
//! the remaining observers still run.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::lifecycle::{SequenceLifecycleEvent, SequenceLifecycleObserver};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::metrics as engine_metrics;

#[derive(Default)]
pub struct LifecycleHooks {
    observers: RwLock<Vec<Arc<dyn SequenceLifecycleObserver>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(event_bus: Arc<EventBus>) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            event_bus: Some(event_bus),
        }
    }

    pub fn register(&self, observer: Arc<dyn SequenceLifecycleObserver>) {
        debug!(observer = observer.name(), "Registering lifecycle observer");
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Returns the number of observers that failed
    pub async fn dispatch(&self, event: SequenceLifecycleEvent) -> usize {
        // Snapshot so no lock is held across awaits
        let observers: Vec<Arc<dyn SequenceLifecycleObserver>> = self.observers.read().clone();

        let mut failures = 0;
        for observer in observers {
            if let Err(e) = observer.on_lifecycle_event(&event).await {
                failures += 1;
                engine_metrics::record_hook_failure(event.name());
                error!(
                    observer = observer.name(),
                    hook = event.name(),
                    keptn_context = %event.keptn_context(),
                    error = %e,
                    "Lifecycle observer failed"
                );
            }
        }

        if let Some(bus) = &self.event_bus {
            bus.publish_lifecycle_event(event);
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event_scope::EventScope;
    use crate::infrastructure::event_bus::DomainEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl SequenceLifecycleObserver for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_lifecycle_event(&self, event: &SequenceLifecycleEvent) -> anyhow::Result<()> {
            self.seen.lock().push(format!("{}:{}", self.name, event.name()));
            if self.fail {
                anyhow::bail!("observer {} failed", self.name);
            }
            Ok(())
        }
    }

    fn aborted() -> SequenceLifecycleEvent {
        SequenceLifecycleEvent::SequenceAborted(EventScope {
            keptn_context: "ctx".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_dispatch_in_order_despite_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = LifecycleHooks::new();
        for (name, fail) in [("first", true), ("second", false)] {
            hooks.register(Arc::new(Recorder {
                name: name.to_string(),
                seen: seen.clone(),
                fail,
            }));
        }

        let failures = hooks.dispatch(aborted()).await;

        assert_eq!(failures, 1);
        assert_eq!(
            *seen.lock(),
            vec!["first:sequence_aborted".to_string(), "second:sequence_aborted".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dispatch_publishes_to_bus() {
        let bus = Arc::new(EventBus::new(8));
        let mut receiver = bus.subscribe();
        let hooks = LifecycleHooks::with_event_bus(bus);

        hooks.dispatch(aborted()).await;

        assert!(matches!(
            receiver.recv().await.unwrap(),
            DomainEvent::Lifecycle(SequenceLifecycleEvent::SequenceAborted(_))
        ));
    }
}
