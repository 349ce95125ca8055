//! Provisioning run record (the saga's aggregate root).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantforge_core::{AggregateRoot, ProvisioningRequest, RunId, TenantId, TenantSlug};

use crate::error::{RollbackError, RunError};
use crate::outcome::StepOutcome;
use crate::step::StepPlan;

/// Run status state machine.
///
/// ```text
/// Pending → Running → Completed
///                   ↘ Failed → RollingBack → RolledBack | RollbackFailed
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    /// Residue may remain in one or more backends; needs an operator.
    RollbackFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::RolledBack | RunStatus::RollbackFailed
        )
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::RollingBack => "rolling_back",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::RollbackFailed => "rollback_failed",
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: RunStatus,
    pub at: DateTime<Utc>,
}

/// Observable record of one provisioning attempt.
///
/// Only the runner mutates a run; everything outside this crate gets
/// read-only accessors. `completed_steps` is append-only and is the sole
/// source of truth for what must be compensated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRun {
    id: RunId,
    tenant_id: TenantId,
    tenant_slug: TenantSlug,
    planned_steps: Vec<String>,
    completed_steps: Vec<String>,
    status: RunStatus,
    status_history: Vec<StatusChange>,
    error: Option<RunError>,
    rollback_errors: Vec<RollbackError>,
    history: Vec<StepOutcome>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl ProvisioningRun {
    /// New `Pending` run planned to execute `plan`'s steps.
    pub fn new(tenant_id: TenantId, tenant_slug: TenantSlug, plan: &StepPlan) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            tenant_id,
            tenant_slug,
            planned_steps: plan.names(),
            completed_steps: Vec::new(),
            status: RunStatus::Pending,
            status_history: vec![StatusChange {
                status: RunStatus::Pending,
                at: now,
            }],
            error: None,
            rollback_errors: Vec::new(),
            history: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn for_request(request: &ProvisioningRequest, plan: &StepPlan) -> Self {
        Self::new(request.tenant_id(), request.slug().clone(), plan)
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn tenant_slug(&self) -> &TenantSlug {
        &self.tenant_slug
    }

    pub fn planned_steps(&self) -> &[String] {
        &self.planned_steps
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Planned steps that never completed (failed, cancelled or not reached).
    pub fn pending_steps(&self) -> &[String] {
        &self.planned_steps[self.completed_steps.len()..]
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Every status entered, oldest first.
    pub fn status_history(&self) -> &[StatusChange] {
        &self.status_history
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    pub fn rollback_errors(&self) -> &[RollbackError] {
        &self.rollback_errors
    }

    /// Every execute/rollback outcome, in call order.
    pub fn history(&self) -> &[StepOutcome] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Partial resources may remain; the slug must not be reused until an
    /// operator has reconciled the failed backends.
    pub fn requires_operator_action(&self) -> bool {
        self.status == RunStatus::RollbackFailed
    }

    /// The tenant was not created and nothing was left behind.
    pub fn is_safe_to_retry(&self) -> bool {
        self.status == RunStatus::RolledBack
    }

    pub(crate) fn transition(&mut self, next: RunStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal run transition {} -> {}",
            self.status,
            next
        );
        let now = Utc::now();
        self.status = next;
        self.status_history.push(StatusChange { status: next, at: now });
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
    }

    pub(crate) fn record_outcome(&mut self, outcome: StepOutcome) {
        debug_assert!(!self.is_terminal(), "terminal runs are immutable");
        self.history.push(outcome);
    }

    pub(crate) fn record_completed(&mut self, step: &str) {
        debug_assert_eq!(self.status, RunStatus::Running);
        self.completed_steps.push(step.to_string());
    }

    pub(crate) fn fail(&mut self, error: RunError) {
        self.error = Some(error);
        self.transition(RunStatus::Failed);
    }

    pub(crate) fn record_rollback_failure(&mut self, error: RollbackError) {
        debug_assert_eq!(self.status, RunStatus::RollingBack);
        self.rollback_errors.push(error);
    }
}

impl AggregateRoot for ProvisioningRun {
    type Id = RunId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.status_history.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_transitions_are_legal() {
        use RunStatus::*;
        let all = [
            Pending,
            Running,
            Completed,
            Failed,
            RollingBack,
            RolledBack,
            RollbackFailed,
        ];
        let legal = [
            (Pending, Running),
            (Running, Completed),
            (Running, Failed),
            (Failed, RollingBack),
            (RollingBack, RolledBack),
            (RollingBack, RollbackFailed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for status in [RunStatus::Completed, RunStatus::RolledBack, RunStatus::RollbackFailed] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(RunStatus::Running));
            assert!(!status.can_transition_to(RunStatus::RollingBack));
        }
        assert!(!RunStatus::Failed.is_terminal());
    }

    #[test]
    fn new_run_is_pending_with_planned_steps() {
        let plan = StepPlan::new(Vec::new());
        let run = ProvisioningRun::new(TenantId::new(), TenantSlug::parse("acme").unwrap(), &plan);

        assert_eq!(run.status(), RunStatus::Pending);
        assert!(run.planned_steps().is_empty());
        assert!(run.completed_steps().is_empty());
        assert_eq!(run.version(), 1);
        assert!(run.started_at().is_none());
    }

    #[test]
    fn statuses_serialize_in_snake_case() {
        let json = serde_json::to_string(&RunStatus::RollbackFailed).unwrap();
        assert_eq!(json, "\"rollback_failed\"");
    }
}
