//! Tenant provisioning saga: step definitions and the factory that orders them.

pub mod steps;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Span, debug};

use tenantforge_core::ProvisioningRequest;
use tenantforge_saga::{Step, StepPlan};

use crate::external::{IdentityProvider, InvitationService, ObjectStorage, SchemaManager, UserDirectory};

pub use steps::{
    AdminUserStep, BucketStep, ClientsStep, InvitationStep, RealmStep, RolesStep, SchemaStep,
};

/// Provisioning steps in canonical execution order.
///
/// The derived `Ord` follows declaration order, which is the order steps
/// must run in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Schema,
    Realm,
    Clients,
    Roles,
    Bucket,
    AdminUser,
    Invitation,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::Schema,
        StepKind::Realm,
        StepKind::Clients,
        StepKind::Roles,
        StepKind::Bucket,
        StepKind::AdminUser,
        StepKind::Invitation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Schema => SchemaStep::NAME,
            StepKind::Realm => RealmStep::NAME,
            StepKind::Clients => ClientsStep::NAME,
            StepKind::Roles => RolesStep::NAME,
            StepKind::Bucket => BucketStep::NAME,
            StepKind::AdminUser => AdminUserStep::NAME,
            StepKind::Invitation => InvitationStep::NAME,
        }
    }
}

impl core::fmt::Display for StepKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds bound step plans from provisioning requests.
///
/// Construction makes no external calls; the request has already been
/// validated by the time it reaches here.
#[derive(Clone)]
pub struct TenantStepFactory {
    schemas: Arc<dyn SchemaManager>,
    identity: Arc<dyn IdentityProvider>,
    storage: Arc<dyn ObjectStorage>,
    users: Arc<dyn UserDirectory>,
    invitations: Arc<dyn InvitationService>,
    span: Span,
}

impl TenantStepFactory {
    pub fn new(
        schemas: Arc<dyn SchemaManager>,
        identity: Arc<dyn IdentityProvider>,
        storage: Arc<dyn ObjectStorage>,
        users: Arc<dyn UserDirectory>,
        invitations: Arc<dyn InvitationService>,
        span: Span,
    ) -> Self {
        Self {
            schemas,
            identity,
            storage,
            users,
            invitations,
            span,
        }
    }

    /// One backend serving every capability (the in-memory platform).
    pub fn single_backend<B>(backend: Arc<B>, span: Span) -> Self
    where
        B: SchemaManager
            + IdentityProvider
            + ObjectStorage
            + UserDirectory
            + InvitationService
            + 'static,
    {
        Self::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
            span,
        )
    }

    /// The full seven-step plan.
    pub fn build(&self, request: &ProvisioningRequest) -> StepPlan {
        self.build_subset(request, &StepKind::ALL)
    }

    /// A plan for `kinds`, re-sorted into canonical order with duplicates removed.
    ///
    /// Prerequisites are not added. A `Roles` plan without `Realm` relies on a
    /// realm created elsewhere, and if such a run fails the runner reports the
    /// roles as left behind instead of delegating their cleanup.
    pub fn build_subset(&self, request: &ProvisioningRequest, kinds: &[StepKind]) -> StepPlan {
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        let steps: Vec<Box<dyn Step>> = kinds.iter().map(|k| self.step(*k, request)).collect();
        let plan = StepPlan::new(steps);
        debug!(parent: &self.span, tenant = %request.slug(), steps = ?plan.names(), "step plan built");
        plan
    }

    fn step(&self, kind: StepKind, request: &ProvisioningRequest) -> Box<dyn Step> {
        let slug = request.slug().clone();
        let span = self.span.clone();
        match kind {
            StepKind::Schema => Box::new(SchemaStep::new(self.schemas.clone(), slug, span)),
            StepKind::Realm => Box::new(RealmStep::new(
                self.identity.clone(),
                slug,
                request.name().clone(),
                span,
            )),
            StepKind::Clients => Box::new(ClientsStep::new(self.identity.clone(), slug, span)),
            StepKind::Roles => Box::new(RolesStep::new(self.identity.clone(), slug, span)),
            StepKind::Bucket => Box::new(BucketStep::new(self.storage.clone(), slug, span)),
            StepKind::AdminUser => Box::new(AdminUserStep::new(
                self.users.clone(),
                slug,
                request.admin_email().clone(),
                span,
            )),
            StepKind::Invitation => Box::new(InvitationStep::new(
                self.invitations.clone(),
                slug,
                request.admin_email().clone(),
                span,
            )),
        }
    }
}

impl core::fmt::Debug for TenantStepFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TenantStepFactory").finish_non_exhaustive()
    }
}
