//! Provisioning service: admission checks, run persistence, saga execution.

use std::sync::Arc;

use thiserror::Error;
use tracing::{Span, error, info, warn};

use tenantforge_core::{AggregateRoot, DomainError, ExpectedVersion, ProvisioningRequest, RunId, TenantSlug};
use tenantforge_saga::{CancellationSignal, ProvisioningRun, RunStatus, SagaRunner};

use crate::runs::{Reconciliation, RunStore, RunStoreError};
use crate::saga::TenantStepFactory;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid provisioning request: {0}")]
    Validation(#[from] DomainError),

    #[error("tenant {slug} is tainted by run {run_id}; an operator must reconcile it first")]
    SlugTainted { slug: TenantSlug, run_id: RunId },

    #[error("tenant {slug} was already provisioned by run {run_id}")]
    AlreadyProvisioned { slug: TenantSlug, run_id: RunId },

    #[error("tenant {0} already has a provisioning run in progress")]
    InProgress(TenantSlug),

    #[error("run store: {0}")]
    Store(RunStoreError),
}

impl From<RunStoreError> for ProvisionError {
    fn from(err: RunStoreError) -> Self {
        match err {
            RunStoreError::SlugBusy(slug) => ProvisionError::InProgress(slug),
            other => ProvisionError::Store(other),
        }
    }
}

/// Entry point for provisioning tenants.
///
/// Cheap to clone; distinct tenants may be provisioned concurrently from
/// clones of the same service.
#[derive(Clone)]
pub struct TenantProvisioner {
    factory: TenantStepFactory,
    runner: SagaRunner,
    store: Arc<dyn RunStore>,
    span: Span,
}

impl TenantProvisioner {
    pub fn new(factory: TenantStepFactory, store: Arc<dyn RunStore>, span: Span) -> Self {
        Self {
            factory,
            runner: SagaRunner::new(span.clone()),
            store,
            span,
        }
    }

    /// Validate raw inputs and provision.
    pub async fn provision_raw(
        &self,
        slug: &str,
        name: &str,
        admin_email: &str,
    ) -> Result<ProvisioningRun, ProvisionError> {
        let request = ProvisioningRequest::new(slug, name, admin_email)?;
        self.provision(&request).await
    }

    pub async fn provision(&self, request: &ProvisioningRequest) -> Result<ProvisioningRun, ProvisionError> {
        self.provision_with_cancellation(request, &CancellationSignal::never())
            .await
    }

    /// Returns the terminal run. Failures of the saga itself are reported in
    /// the run, not as `Err`.
    pub async fn provision_with_cancellation(
        &self,
        request: &ProvisioningRequest,
        cancel: &CancellationSignal,
    ) -> Result<ProvisioningRun, ProvisionError> {
        self.admit(request.slug()).await?;

        let plan = self.factory.build(request);
        let pending = ProvisioningRun::for_request(request, &plan);
        let pending_version = pending.version();
        self.store.save(&pending, ExpectedVersion::New).await?;

        let run = self
            .runner
            .run_with_cancellation(pending, plan, cancel)
            .await;

        if let Err(err) = self
            .store
            .save(&run, ExpectedVersion::Exact(pending_version))
            .await
        {
            error!(
                parent: &self.span,
                run_id = %run.id(),
                tenant = %run.tenant_slug(),
                status = %run.status(),
                error = %err,
                "failed to persist terminal run"
            );
            return Err(err.into());
        }
        Ok(run)
    }

    /// Every earlier run for the slug counts, not only the latest: a completed
    /// run refuses the slug for good, and any unreconciled `RollbackFailed`
    /// run taints it.
    async fn admit(&self, slug: &TenantSlug) -> Result<(), ProvisionError> {
        let runs = self.store.runs_for_slug(slug).await?;

        if let Some(done) = runs.iter().find(|r| r.status() == RunStatus::Completed) {
            return Err(ProvisionError::AlreadyProvisioned {
                slug: slug.clone(),
                run_id: done.id(),
            });
        }
        if runs.iter().any(|r| !r.is_terminal()) {
            return Err(ProvisionError::InProgress(slug.clone()));
        }

        for failed in runs.iter().filter(|r| r.requires_operator_action()) {
            if self.store.reconciliation(failed.id()).await?.is_none() {
                warn!(parent: &self.span, tenant = %slug, run_id = %failed.id(), "refusing to provision tainted slug");
                return Err(ProvisionError::SlugTainted {
                    slug: slug.clone(),
                    run_id: failed.id(),
                });
            }
            info!(parent: &self.span, tenant = %slug, run_id = %failed.id(), "previous failed run was reconciled");
        }
        Ok(())
    }

    pub async fn run(&self, run_id: RunId) -> Result<Option<ProvisioningRun>, ProvisionError> {
        Ok(self.store.get(run_id).await?)
    }

    pub async fn tainted_slugs(&self) -> Result<Vec<TenantSlug>, ProvisionError> {
        Ok(self.store.tainted_slugs().await?)
    }

    /// Operator sign-off after manually cleaning up a `RollbackFailed` run.
    pub async fn clear_taint(&self, run_id: RunId, note: &str) -> Result<Reconciliation, ProvisionError> {
        let reconciliation = self.store.clear_taint(run_id, note).await?;
        info!(parent: &self.span, %run_id, note, "taint cleared");
        Ok(reconciliation)
    }
}

impl core::fmt::Debug for TenantProvisioner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TenantProvisioner")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
