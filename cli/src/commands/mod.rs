// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Shipyard CLI

pub mod config;
pub mod simulate;

pub use self::config::ConfigCommand;
pub use self::simulate::SimulateArgs;
