// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Argus CLI

pub mod config;
pub mod modules;
pub mod scan;

pub use self::config::ConfigCommand;
pub use self::modules::ModulesCommand;
pub use self::scan::ScanArgs;
