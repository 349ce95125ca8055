//! Saga runner: sequential execution with reverse-order compensation.
//!
//! ```text
//! Pending
//!   ↓
//! Running ── execute step 1..n in order ──→ Completed
//!   ↓ (step failed / cancelled)
//! Failed
//!   ↓
//! RollingBack ── rollback completed steps n-1..1 ──→ RolledBack | RollbackFailed
//! ```
//!
//! The runner performs no IO itself: every side effect happens inside a
//! step. It never returns an error; callers inspect the terminal run.

use chrono::Utc;
use tracing::{Instrument, Span, error, info, info_span, warn};

use crate::cancel::CancellationSignal;
use crate::error::{RollbackError, RunError, StepExecutionError};
use crate::outcome::{OutcomeKind, StepOutcome, StepPhase};
use crate::run::{ProvisioningRun, RunStatus};
use crate::step::{RollbackKind, Step, StepPlan};

/// Drives `ProvisioningRun`s through their state machine.
///
/// Holds no per-run state, so one runner can serve concurrent runs for
/// different tenants.
#[derive(Debug, Clone)]
pub struct SagaRunner {
    span: Span,
}

impl SagaRunner {
    /// `span` is the logging context every run span is parented to.
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub async fn run(&self, run: ProvisioningRun, plan: StepPlan) -> ProvisioningRun {
        self.run_with_cancellation(run, plan, &CancellationSignal::never())
            .await
    }

    pub async fn run_with_cancellation(
        &self,
        run: ProvisioningRun,
        plan: StepPlan,
        cancel: &CancellationSignal,
    ) -> ProvisioningRun {
        let span = info_span!(
            parent: &self.span,
            "provisioning_run",
            run_id = %run.id(),
            tenant = %run.tenant_slug(),
        );
        drive(run, plan, cancel).instrument(span).await
    }
}

async fn drive(
    mut run: ProvisioningRun,
    plan: StepPlan,
    cancel: &CancellationSignal,
) -> ProvisioningRun {
    if run.status() != RunStatus::Pending {
        warn!(status = %run.status(), "run is not pending; refusing to execute");
        return run;
    }

    run.transition(RunStatus::Running);

    let supplied = plan.names();
    if supplied != run.planned_steps() {
        error!(
            planned = ?run.planned_steps(),
            supplied = ?supplied,
            "step plan does not match the run's planned steps; refusing to execute"
        );
        run.fail(RunError::PlanMismatch {
            planned: run.planned_steps().to_vec(),
            supplied,
        });
        compensate(&mut run, &[], cancel).await;
        return run;
    }

    let steps = plan.into_steps();
    info!(steps = steps.len(), "provisioning run started");

    let mut completed: Vec<&dyn Step> = Vec::with_capacity(steps.len());

    for step in &steps {
        let name = step.name();

        if cancel.is_cancelled() {
            warn!(step = name, "run cancelled before step");
            run.fail(RunError::Cancelled {
                before_step: name.to_string(),
            });
            break;
        }

        info!(step = name, "step started");
        let started_at = Utc::now();

        match step.execute().await {
            Ok(()) => {
                run.record_outcome(StepOutcome::new(
                    name,
                    StepPhase::Execute,
                    OutcomeKind::Succeeded,
                    started_at,
                ));
                run.record_completed(name);
                completed.push(step.as_ref());
                info!(step = name, "step succeeded");
            }
            Err(cause) => {
                let err = StepExecutionError::new(name, &cause);
                error!(step = name, error = %err.cause, "step failed");
                run.record_outcome(StepOutcome::new(
                    name,
                    StepPhase::Execute,
                    OutcomeKind::Failed {
                        cause: err.cause.clone(),
                    },
                    started_at,
                ));
                run.fail(RunError::StepFailed(err));
                break;
            }
        }
    }

    if run.status() == RunStatus::Running {
        run.transition(RunStatus::Completed);
        info!(status = %run.status(), "provisioning run finished");
        return run;
    }

    compensate(&mut run, &completed, cancel).await;
    run
}

async fn compensate(run: &mut ProvisioningRun, completed: &[&dyn Step], cancel: &CancellationSignal) {
    run.transition(RunStatus::RollingBack);
    info!(steps = completed.len(), "compensation started");

    let mut cancelled = false;

    for step in completed.iter().rev() {
        let name = step.name();

        if !cancelled && cancel.is_cancelled() {
            warn!(step = name, "compensation cancelled; remaining rollbacks will not be attempted");
            cancelled = true;
        }
        if cancelled {
            let err = RollbackError::not_attempted(name, "compensation cancelled before rollback");
            run.record_outcome(StepOutcome::new(
                name,
                StepPhase::Rollback,
                OutcomeKind::Failed {
                    cause: err.cause.clone(),
                },
                Utc::now(),
            ));
            run.record_rollback_failure(err);
            continue;
        }

        if let RollbackKind::SubsumedBy(other) = step.rollback_kind() {
            if !run.completed_steps().iter().any(|s| s == other) {
                error!(step = name, subsumed_by = other, "rollback depends on a step that did not complete");
                let err = RollbackError::not_attempted(
                    name,
                    format!("rollback is subsumed by `{other}`, which did not complete"),
                );
                run.record_outcome(StepOutcome::new(
                    name,
                    StepPhase::Rollback,
                    OutcomeKind::Failed {
                        cause: err.cause.clone(),
                    },
                    Utc::now(),
                ));
                run.record_rollback_failure(err);
                continue;
            }
        }

        info!(step = name, "rollback started");
        let started_at = Utc::now();

        match step.rollback().await {
            Ok(()) => {
                let kind = match step.rollback_kind() {
                    RollbackKind::Compensates => {
                        info!(step = name, "rollback succeeded");
                        OutcomeKind::Succeeded
                    }
                    RollbackKind::SubsumedBy(other) => {
                        info!(step = name, subsumed_by = other, "rollback is a no-op");
                        OutcomeKind::Skipped {
                            subsumed_by: other.to_string(),
                        }
                    }
                };
                run.record_outcome(StepOutcome::new(name, StepPhase::Rollback, kind, started_at));
            }
            Err(cause) => {
                let err = RollbackError::new(name, &cause);
                error!(step = name, error = %err.cause, "rollback failed");
                run.record_outcome(StepOutcome::new(
                    name,
                    StepPhase::Rollback,
                    OutcomeKind::Failed {
                        cause: err.cause.clone(),
                    },
                    started_at,
                ));
                run.record_rollback_failure(err);
            }
        }
    }

    if run.rollback_errors().is_empty() {
        run.transition(RunStatus::RolledBack);
        info!(
            status = %run.status(),
            failed_step = run.error().and_then(RunError::step),
            "provisioning run finished"
        );
    } else {
        run.transition(RunStatus::RollbackFailed);
        error!(
            status = %run.status(),
            failed_step = run.error().and_then(RunError::step),
            rollback_failures = run.rollback_errors().len(),
            "provisioning run finished with residue; operator action required"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use proptest::prelude::*;
    use tenantforge_core::{TenantId, TenantSlug};

    use super::*;
    use crate::cancel::{CancellationHandle, cancellation};

    type Journal = Arc<Mutex<Vec<String>>>;

    const NAMES: [&str; 7] = [
        "schema",
        "realm",
        "clients",
        "roles",
        "bucket",
        "admin_user",
        "invitation",
    ];

    /// Test double that records every call and fails on demand.
    struct ScriptedStep {
        name: &'static str,
        journal: Journal,
        fail_execute: bool,
        fail_rollback: bool,
        kind: RollbackKind,
        cancel_on_execute: Option<CancellationHandle>,
        cancel_on_rollback: Option<CancellationHandle>,
    }

    impl ScriptedStep {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail_execute: false,
                fail_rollback: false,
                kind: RollbackKind::Compensates,
                cancel_on_execute: None,
                cancel_on_rollback: None,
            }
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn rollback_kind(&self) -> RollbackKind {
            self.kind
        }

        async fn execute(&self) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("execute:{}", self.name));
            if let Some(handle) = &self.cancel_on_execute {
                handle.cancel();
            }
            if self.fail_execute {
                anyhow::bail!("{} backend unavailable", self.name);
            }
            Ok(())
        }

        async fn rollback(&self) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("rollback:{}", self.name));
            if let Some(handle) = &self.cancel_on_rollback {
                handle.cancel();
            }
            if self.fail_rollback {
                anyhow::bail!("{} cleanup rejected", self.name);
            }
            Ok(())
        }
    }

    fn steps(journal: &Journal) -> Vec<ScriptedStep> {
        NAMES
            .iter()
            .map(|name| {
                let mut step = ScriptedStep::new(name, journal);
                if *name == "roles" {
                    step.kind = RollbackKind::SubsumedBy("realm");
                }
                step
            })
            .collect()
    }

    fn plan_and_run(steps: Vec<ScriptedStep>) -> (StepPlan, ProvisioningRun) {
        let plan = StepPlan::new(
            steps
                .into_iter()
                .map(|s| Box::new(s) as Box<dyn Step>)
                .collect(),
        );
        let run = ProvisioningRun::new(TenantId::new(), TenantSlug::parse("acme").unwrap(), &plan);
        (plan, run)
    }

    fn runner() -> SagaRunner {
        SagaRunner::new(Span::none())
    }

    fn calls(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    fn statuses(run: &ProvisioningRun) -> Vec<RunStatus> {
        run.status_history().iter().map(|c| c.status).collect()
    }

    #[tokio::test]
    async fn all_steps_succeed_and_run_completes() {
        let journal = Journal::default();
        let (plan, run) = plan_and_run(steps(&journal));

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.completed_steps(), NAMES.map(String::from));
        assert!(run.error().is_none());
        assert!(run.rollback_errors().is_empty());
        assert_eq!(
            statuses(&run),
            vec![RunStatus::Pending, RunStatus::Running, RunStatus::Completed]
        );
        assert!(calls(&journal).iter().all(|c| c.starts_with("execute:")));
        assert!(run.finished_at().is_some());
    }

    #[tokio::test]
    async fn failure_rolls_back_completed_steps_in_reverse() {
        let journal = Journal::default();
        let mut steps = steps(&journal);
        steps[3].fail_execute = true;
        let (plan, run) = plan_and_run(steps);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RolledBack);
        assert_eq!(run.completed_steps(), ["schema", "realm", "clients"]);
        assert_eq!(
            calls(&journal),
            vec![
                "execute:schema",
                "execute:realm",
                "execute:clients",
                "execute:roles",
                "rollback:clients",
                "rollback:realm",
                "rollback:schema",
            ]
        );
        match run.error() {
            Some(RunError::StepFailed(err)) => {
                assert_eq!(err.step, "roles");
                assert_eq!(err.cause, "roles backend unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            statuses(&run),
            vec![
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Failed,
                RunStatus::RollingBack,
                RunStatus::RolledBack,
            ]
        );
        assert!(run.is_safe_to_retry());
        assert_eq!(run.pending_steps(), ["roles", "bucket", "admin_user", "invitation"]);
    }

    #[tokio::test]
    async fn rollback_failure_does_not_stop_compensation() {
        let journal = Journal::default();
        let mut steps = steps(&journal);
        steps[1].fail_rollback = true;
        steps[3].fail_execute = true;
        let (plan, run) = plan_and_run(steps);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RollbackFailed);
        assert!(run.requires_operator_action());
        assert!(calls(&journal).contains(&"rollback:schema".to_string()));
        assert_eq!(run.rollback_errors().len(), 1);
        assert_eq!(run.rollback_errors()[0].step, "realm");
        assert_eq!(run.rollback_errors()[0].cause, "realm cleanup rejected");
        assert_eq!(run.error().and_then(RunError::step), Some("roles"));
    }

    #[tokio::test]
    async fn subsumed_rollback_is_called_and_recorded_as_skipped() {
        let journal = Journal::default();
        let mut steps = steps(&journal);
        steps[4].fail_execute = true;
        let (plan, run) = plan_and_run(steps);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RolledBack);
        let rollbacks: Vec<_> = run
            .history()
            .iter()
            .filter(|o| o.phase == StepPhase::Rollback)
            .collect();
        assert_eq!(rollbacks.len(), 4);
        assert_eq!(rollbacks[0].step, "roles");
        assert_eq!(
            rollbacks[0].kind,
            OutcomeKind::Skipped {
                subsumed_by: "realm".to_string()
            }
        );
        assert!(rollbacks.iter().all(|o| o.is_success()));
    }

    #[tokio::test]
    async fn first_step_failure_needs_no_rollback() {
        let journal = Journal::default();
        let mut steps = steps(&journal);
        steps[0].fail_execute = true;
        let (plan, run) = plan_and_run(steps);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RolledBack);
        assert_eq!(calls(&journal), vec!["execute:schema"]);
        assert!(run.completed_steps().is_empty());
    }

    #[tokio::test]
    async fn cancellation_between_steps_triggers_compensation() {
        let journal = Journal::default();
        let (handle, signal) = cancellation();
        let mut steps = steps(&journal);
        steps[1].cancel_on_execute = Some(handle);
        let (plan, run) = plan_and_run(steps);

        let run = runner().run_with_cancellation(run, plan, &signal).await;

        // realm was in flight when cancel arrived: it completes and is undone.
        assert_eq!(run.completed_steps(), ["schema", "realm"]);
        assert_eq!(
            run.error(),
            Some(&RunError::Cancelled {
                before_step: "clients".to_string()
            })
        );
        assert_eq!(run.status(), RunStatus::RolledBack);
        assert_eq!(
            calls(&journal),
            vec!["execute:schema", "execute:realm", "rollback:realm", "rollback:schema"]
        );
    }

    #[tokio::test]
    async fn cancellation_during_compensation_leaves_residue_flagged() {
        let journal = Journal::default();
        let (handle, signal) = cancellation();
        let mut steps = steps(&journal);
        steps[2].cancel_on_rollback = Some(handle);
        steps[3].fail_execute = true;
        let (plan, run) = plan_and_run(steps);

        let run = runner().run_with_cancellation(run, plan, &signal).await;

        assert_eq!(run.status(), RunStatus::RollbackFailed);
        assert_eq!(
            calls(&journal).last().map(String::as_str),
            Some("rollback:clients")
        );
        let skipped: Vec<_> = run.rollback_errors().iter().map(|e| e.step.as_str()).collect();
        assert_eq!(skipped, ["realm", "schema"]);
    }

    #[tokio::test]
    async fn refuses_a_run_that_is_not_pending() {
        let journal = Journal::default();
        let (plan, run) = plan_and_run(steps(&journal));
        let done = runner().run(run, plan).await;

        let (replay, _) = plan_and_run(steps(&journal));
        let before = calls(&journal).len();
        let again = runner().run(done.clone(), replay).await;

        assert_eq!(again, done);
        assert_eq!(calls(&journal).len(), before);
    }

    #[tokio::test]
    async fn refuses_a_plan_that_differs_from_the_run() {
        let journal = Journal::default();
        let (_, run) = plan_and_run(steps(&journal));
        let mut shorter = steps(&journal);
        shorter.truncate(3);
        let (plan, _) = plan_and_run(shorter);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RolledBack);
        assert!(run.is_terminal());
        assert!(calls(&journal).is_empty());
        assert!(run.completed_steps().is_empty());
        assert!(run.history().is_empty());
        match run.error() {
            Some(RunError::PlanMismatch { planned, supplied }) => {
                assert_eq!(planned.len(), 7);
                assert_eq!(supplied, &["schema", "realm", "clients"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            statuses(&run),
            vec![
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Failed,
                RunStatus::RollingBack,
                RunStatus::RolledBack,
            ]
        );
    }

    #[tokio::test]
    async fn subsumed_rollback_without_its_owner_is_a_rollback_failure() {
        let journal = Journal::default();
        let mut roles = ScriptedStep::new("roles", &journal);
        roles.kind = RollbackKind::SubsumedBy("realm");
        let mut bucket = ScriptedStep::new("bucket", &journal);
        bucket.fail_execute = true;
        let (plan, run) = plan_and_run(vec![roles, bucket]);

        let run = runner().run(run, plan).await;

        assert_eq!(run.status(), RunStatus::RollbackFailed);
        assert!(!run.is_safe_to_retry());
        assert!(run.requires_operator_action());
        assert_eq!(run.rollback_errors().len(), 1);
        assert_eq!(run.rollback_errors()[0].step, "roles");
        assert!(run.rollback_errors()[0].cause.contains("`realm`"));
        assert_eq!(calls(&journal), vec!["execute:roles", "execute:bucket"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: when step `k` fails, exactly steps `0..k` are rolled back,
        /// in reverse order, every one of them is attempted regardless of
        /// earlier rollback failures, and the terminal status reflects whether
        /// any rollback failed.
        #[test]
        fn compensation_covers_exactly_the_completed_prefix(
            fail_at in 0usize..7,
            rollback_failures in prop::collection::vec(any::<bool>(), 7),
        ) {
            let journal = Journal::default();
            let mut steps = steps(&journal);
            steps[fail_at].fail_execute = true;
            for (step, fail) in steps.iter_mut().zip(&rollback_failures) {
                step.fail_rollback = *fail;
            }
            let (plan, run) = plan_and_run(steps);

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let run = rt.block_on(runner().run(run, plan));

            let expected_rollbacks: Vec<String> = NAMES[..fail_at]
                .iter()
                .rev()
                .map(|n| format!("rollback:{n}"))
                .collect();
            let actual_rollbacks: Vec<String> = calls(&journal)
                .into_iter()
                .filter(|c| c.starts_with("rollback:"))
                .collect();
            prop_assert_eq!(actual_rollbacks, expected_rollbacks);

            let any_rollback_failed = rollback_failures[..fail_at].iter().any(|f| *f);
            let expected_status = if any_rollback_failed {
                RunStatus::RollbackFailed
            } else {
                RunStatus::RolledBack
            };
            prop_assert_eq!(run.status(), expected_status);
            prop_assert_eq!(
                run.rollback_errors().len(),
                rollback_failures[..fail_at].iter().filter(|f| **f).count()
            );
            let failed_rollback = format!("rollback:{}", NAMES[fail_at]);
            prop_assert!(!calls(&journal).contains(&failed_rollback));
        }
    }
}
