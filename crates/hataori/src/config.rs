//! Workflow configuration.

use hataori_core::WorkflowError;
use serde::{Deserialize, Serialize};

/// Default cap on step executions per run.
pub const DEFAULT_MAX_STEPS: usize = 100;

/// Tunables for a [`Workflow`](crate::Workflow).
///
/// Deserializes with defaults for missing fields, so it can be embedded in a
/// host's own configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum number of step executions in a single run. Must be at
    /// least 1.
    pub max_steps: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl WorkflowConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the step-execution cap.
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Rejects a configuration under which no step could ever run.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_steps == 0 {
            return Err(WorkflowError::Configuration(
                "max_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
