//! Step contract shared by every provisioning step.

use async_trait::async_trait;

/// How a step's `rollback()` relates to the rest of the plan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RollbackKind {
    /// `rollback()` undoes this step's own side effect.
    Compensates,
    /// `rollback()` is intentionally empty: the named step (which executed
    /// earlier and therefore rolls back later) already removes this step's
    /// effect.
    SubsumedBy(&'static str),
}

/// A named unit of forward work with a paired undo.
///
/// Implementors are bound at construction to the tenant parameters they act
/// on and carry no other mutable state. The runner guarantees:
/// - `execute` is called at most once per instance
/// - `rollback` is only called after `execute` returned `Ok`
///
/// `rollback` must tolerate the target being already gone (e.g. removed by a
/// cascading delete) and treat that as success.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable step name (logging, run records, rollback ordering).
    fn name(&self) -> &'static str;

    fn rollback_kind(&self) -> RollbackKind {
        RollbackKind::Compensates
    }

    async fn execute(&self) -> anyhow::Result<()>;

    async fn rollback(&self) -> anyhow::Result<()>;
}

/// Ordered steps for one provisioning attempt.
///
/// Consumed by the runner, so a plan can never be executed twice.
pub struct StepPlan {
    steps: Vec<Box<dyn Step>>,
}

impl StepPlan {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn into_steps(self) -> Vec<Box<dyn Step>> {
        self.steps
    }
}

impl core::fmt::Debug for StepPlan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepPlan").field("steps", &self.names()).finish()
    }
}
