// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shipyard Core
//!
//! Event correlation and sequence progression for the three-phase
//! triggered/started/finished task protocol.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services and their adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
