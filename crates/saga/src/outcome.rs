//! Per-call outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Execute,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    /// Rollback was a declared no-op; counts as success.
    Skipped { subsumed_by: String },
    Failed { cause: String },
}

/// Result of one `execute()` or `rollback()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub phase: StepPhase,
    #[serde(flatten)]
    pub kind: OutcomeKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn new(
        step: impl Into<String>,
        phase: StepPhase,
        kind: OutcomeKind,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            step: step.into(),
            phase,
            kind,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.kind, OutcomeKind::Failed { .. })
    }
}
