// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Engine metrics.
//!
//! Counters recorded by the correlator, hooks and ingestor. They complement
//! the structured logs; nothing is recorded unless the binary installs a
//! recorder.

use metrics::{counter, describe_counter};

/// Events pulled from the source and handed to the processor.
pub const EVENTS_INGESTED: &str = "shipyard_events_ingested_total";

/// Messages acked and skipped because they were not valid events.
pub const MESSAGES_MALFORMED: &str = "shipyard_messages_malformed_total";

/// Correlations that ended without a matching prior-phase event.
pub const CORRELATION_FAILURES: &str = "shipyard_correlation_failures_total";

/// Store lookups repeated after a miss.
pub const CORRELATION_RETRIES: &str = "shipyard_correlation_retries_total";

/// Lifecycle observers that returned an error.
pub const HOOK_FAILURES: &str = "shipyard_hook_failures_total";

/// Registers all metric descriptions.
///
/// Call once at startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(EVENTS_INGESTED, "Total events ingested, by phase");
    describe_counter!(MESSAGES_MALFORMED, "Total malformed messages skipped");
    describe_counter!(CORRELATION_FAILURES, "Total correlation failures, by phase");
    describe_counter!(CORRELATION_RETRIES, "Total correlation lookup retries");
    describe_counter!(HOOK_FAILURES, "Total lifecycle observer failures, by hook");
}

pub fn record_event_ingested(phase: &str) {
    counter!(EVENTS_INGESTED, "phase" => phase.to_string()).increment(1);
}

pub fn record_malformed_message() {
    counter!(MESSAGES_MALFORMED).increment(1);
}

pub fn record_correlation_failure(phase: &str) {
    counter!(CORRELATION_FAILURES, "phase" => phase.to_string()).increment(1);
}

pub fn record_correlation_retry() {
    counter!(CORRELATION_RETRIES).increment(1);
}

pub fn record_hook_failure(hook: &str) {
    counter!(HOOK_FAILURES, "hook" => hook.to_string()).increment(1);
}
