// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Error taxonomy for module execution and scan setup.
//!
//! Module-level errors are contained: they fail one work item, or at worst put
//! one module into the skip state. Only [`FatalScanError`] ends a scan, and it
//! does so through the `ERROR_FAILED` transition rather than by propagating.

use std::time::Duration;
use thiserror::Error;

use crate::domain::repository::RepositoryError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    /// Bad or missing configuration. The module is skipped for the whole scan.
    #[error("Module setup failed: {0}")]
    Setup(String),

    /// One `handle()` call failed. Only that work item is affected.
    #[error("Module runtime error: {0}")]
    Runtime(String),

    #[error("Module timed out after {0:?}")]
    Timeout(Duration),

    #[error("Module invocation cancelled")]
    Cancelled,

    /// Cumulative runtime budget for this scan is spent.
    #[error("Module runtime budget of {budget:?} exhausted (used {used:?})")]
    BudgetExhausted { budget: Duration, used: Duration },
}

impl ModuleError {
    /// Persistent errors move the module into the skip state.
    pub fn is_persistent(&self) -> bool {
        matches!(self, ModuleError::Setup(_) | ModuleError::BudgetExhausted { .. })
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ModuleError::Runtime(message.into())
    }
}

/// Infrastructure failure that moves a scan to `ERROR_FAILED`.
#[derive(Debug, Error)]
pub enum FatalScanError {
    #[error("No enabled module could be configured")]
    NoUsableModules,

    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    #[error("Failed to seed root event: {0}")]
    Seed(String),

    #[error("Persistence failure: {0}")]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_classification() {
        assert!(ModuleError::Setup("missing api_key".into()).is_persistent());
        assert!(ModuleError::BudgetExhausted {
            budget: Duration::from_secs(1),
            used: Duration::from_secs(2),
        }
        .is_persistent());
        assert!(!ModuleError::runtime("http 500").is_persistent());
        assert!(!ModuleError::Timeout(Duration::from_secs(5)).is_persistent());
        assert!(!ModuleError::Cancelled.is_persistent());
    }
}
