// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sequence Lifecycle Events
//!
//! One sealed enum for every transition of a sequence run. Observers receive
//! the whole enum and match on it, so adding a transition is a compile error
//! in every observer that forgot to handle it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::event_scope::EventScope;
use crate::domain::payload::InboundEvent;
use crate::domain::sequence_execution::SequenceTimeout;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SequenceLifecycleEvent {
    SequenceTriggered(InboundEvent),
    SequenceStarted(InboundEvent),
    SequenceWaiting(InboundEvent),
    TaskTriggered(InboundEvent),
    TaskStarted(InboundEvent),
    TaskFinished(InboundEvent),
    /// A stage's sequence completed and the run continues elsewhere
    SubSequenceFinished(InboundEvent),
    SequenceFinished(InboundEvent),
    SequencePaused(EventScope),
    SequenceResumed(EventScope),
    SequenceAborted(EventScope),
    SequenceTimedOut(SequenceTimeout),
}

impl SequenceLifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SequenceTriggered(_) => "sequence_triggered",
            Self::SequenceStarted(_) => "sequence_started",
            Self::SequenceWaiting(_) => "sequence_waiting",
            Self::TaskTriggered(_) => "task_triggered",
            Self::TaskStarted(_) => "task_started",
            Self::TaskFinished(_) => "task_finished",
            Self::SubSequenceFinished(_) => "sub_sequence_finished",
            Self::SequenceFinished(_) => "sequence_finished",
            Self::SequencePaused(_) => "sequence_paused",
            Self::SequenceResumed(_) => "sequence_resumed",
            Self::SequenceAborted(_) => "sequence_aborted",
            Self::SequenceTimedOut(_) => "sequence_timed_out",
        }
    }

    pub fn keptn_context(&self) -> &str {
        match self {
            Self::SequenceTriggered(e)
            | Self::SequenceStarted(e)
            | Self::SequenceWaiting(e)
            | Self::TaskTriggered(e)
            | Self::TaskStarted(e)
            | Self::TaskFinished(e)
            | Self::SubSequenceFinished(e)
            | Self::SequenceFinished(e) => e.keptn_context(),
            Self::SequencePaused(scope) | Self::SequenceResumed(scope) | Self::SequenceAborted(scope) => {
                &scope.keptn_context
            }
            Self::SequenceTimedOut(timeout) => &timeout.keptn_context,
        }
    }
}

/// Receiver of lifecycle events.
///
/// Observers are best-effort: an error is logged by the dispatcher and never
/// rolls back the transition that produced the event.
#[async_trait]
pub trait SequenceLifecycleObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_lifecycle_event(&self, event: &SequenceLifecycleEvent) -> anyhow::Result<()>;
}
