//! Saga error taxonomy.
//!
//! Causes are rendered to strings (`{:#}`, full context chain) so run records
//! stay serializable and comparable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A forward `execute()` failure. Always triggers compensation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("step `{step}` failed: {cause}")]
pub struct StepExecutionError {
    pub step: String,
    pub cause: String,
}

impl StepExecutionError {
    pub fn new(step: impl Into<String>, cause: &anyhow::Error) -> Self {
        Self {
            step: step.into(),
            cause: format!("{cause:#}"),
        }
    }
}

/// A `rollback()` failure. Collected on the run, never aborts compensation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rollback of step `{step}` failed: {cause}")]
pub struct RollbackError {
    pub step: String,
    pub cause: String,
}

impl RollbackError {
    pub fn new(step: impl Into<String>, cause: &anyhow::Error) -> Self {
        Self {
            step: step.into(),
            cause: format!("{cause:#}"),
        }
    }

    pub fn not_attempted(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            cause: reason.into(),
        }
    }
}

/// Why forward progress stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    #[error(transparent)]
    StepFailed(StepExecutionError),
    #[error("run cancelled before step `{before_step}`")]
    Cancelled { before_step: String },
    /// The supplied plan did not match the run's planned steps; nothing ran.
    #[error("step plan {supplied:?} does not match the planned steps {planned:?}")]
    PlanMismatch {
        planned: Vec<String>,
        supplied: Vec<String>,
    },
}

impl RunError {
    /// Name of the step forward progress stopped at, if any step was reached.
    pub fn step(&self) -> Option<&str> {
        match self {
            RunError::StepFailed(e) => Some(&e.step),
            RunError::Cancelled { before_step } => Some(before_step),
            RunError::PlanMismatch { .. } => None,
        }
    }
}
