// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Event envelope, sequence aggregate, read model and the persistence
//! contracts the application layer is written against.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants; no I/O

pub mod engine_config;
pub mod event;
pub mod event_scope;
pub mod lifecycle;
pub mod payload;
pub mod repository;
pub mod sequence_execution;
pub mod sequence_state;
