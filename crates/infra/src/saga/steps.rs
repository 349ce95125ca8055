//! The seven tenant provisioning steps.
//!
//! Every step is bound at construction to the tenant it acts on and to the
//! backend it talks to. Rollbacks treat a missing target as already undone.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{Span, info, warn};

use tenantforge_core::{AdminEmail, TenantName, TenantSlug};
use tenantforge_saga::{RollbackKind, Step};

use crate::external::{
    BackendError, IdentityProvider, InvitationService, ObjectStorage, Revocation, SchemaManager,
    UserDirectory,
};

/// Map a rollback result so that "already gone" counts as success.
fn tolerate_missing(
    span: &Span,
    step: &'static str,
    result: Result<(), BackendError>,
) -> Result<(), BackendError> {
    match result {
        Err(BackendError::NotFound(detail)) => {
            warn!(parent: span, step, %detail, "rollback target already absent; nothing to undo");
            Ok(())
        }
        other => other,
    }
}

pub struct SchemaStep {
    schemas: Arc<dyn SchemaManager>,
    slug: TenantSlug,
    span: Span,
}

impl SchemaStep {
    pub const NAME: &'static str = "schema";

    pub fn new(schemas: Arc<dyn SchemaManager>, slug: TenantSlug, span: Span) -> Self {
        Self { schemas, slug, span }
    }
}

#[async_trait]
impl Step for SchemaStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.schemas
            .create_schema(&self.slug)
            .await
            .with_context(|| format!("create schema {}", self.slug.schema_name()))?;
        info!(parent: &self.span, schema = %self.slug.schema_name(), "tenant schema created");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let result = self.schemas.drop_schema(&self.slug).await;
        tolerate_missing(&self.span, Self::NAME, result)
            .with_context(|| format!("drop schema {}", self.slug.schema_name()))?;
        Ok(())
    }
}

pub struct RealmStep {
    identity: Arc<dyn IdentityProvider>,
    slug: TenantSlug,
    name: TenantName,
    span: Span,
}

impl RealmStep {
    pub const NAME: &'static str = "realm";

    pub fn new(identity: Arc<dyn IdentityProvider>, slug: TenantSlug, name: TenantName, span: Span) -> Self {
        Self {
            identity,
            slug,
            name,
            span,
        }
    }
}

#[async_trait]
impl Step for RealmStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.identity
            .create_realm(&self.slug, &self.name)
            .await
            .with_context(|| format!("create realm {}", self.slug.realm_name()))?;
        info!(parent: &self.span, realm = %self.slug.realm_name(), "identity realm created");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let result = self.identity.delete_realm(&self.slug).await;
        tolerate_missing(&self.span, Self::NAME, result)
            .with_context(|| format!("delete realm {}", self.slug.realm_name()))?;
        Ok(())
    }
}

pub struct ClientsStep {
    identity: Arc<dyn IdentityProvider>,
    slug: TenantSlug,
    span: Span,
}

impl ClientsStep {
    pub const NAME: &'static str = "clients";

    pub fn new(identity: Arc<dyn IdentityProvider>, slug: TenantSlug, span: Span) -> Self {
        Self { identity, slug, span }
    }
}

#[async_trait]
impl Step for ClientsStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.identity
            .create_clients(&self.slug)
            .await
            .with_context(|| format!("register clients in realm {}", self.slug.realm_name()))?;
        info!(parent: &self.span, realm = %self.slug.realm_name(), "oidc clients registered");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let result = self.identity.delete_clients(&self.slug).await;
        tolerate_missing(&self.span, Self::NAME, result)
            .with_context(|| format!("delete clients in realm {}", self.slug.realm_name()))?;
        Ok(())
    }
}

/// Realm roles plus refresh-token rotation.
///
/// Nothing to undo on its own: deleting the realm removes the roles and the
/// realm settings with it.
pub struct RolesStep {
    identity: Arc<dyn IdentityProvider>,
    slug: TenantSlug,
    span: Span,
}

impl RolesStep {
    pub const NAME: &'static str = "roles";

    pub fn new(identity: Arc<dyn IdentityProvider>, slug: TenantSlug, span: Span) -> Self {
        Self { identity, slug, span }
    }
}

#[async_trait]
impl Step for RolesStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn rollback_kind(&self) -> RollbackKind {
        RollbackKind::SubsumedBy(RealmStep::NAME)
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.identity
            .provision_roles(&self.slug)
            .await
            .with_context(|| format!("provision roles in realm {}", self.slug.realm_name()))?;
        self.identity
            .configure_refresh_rotation(&self.slug)
            .await
            .with_context(|| {
                format!("configure refresh rotation in realm {}", self.slug.realm_name())
            })?;
        info!(parent: &self.span, realm = %self.slug.realm_name(), "roles provisioned, refresh rotation on");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct BucketStep {
    storage: Arc<dyn ObjectStorage>,
    slug: TenantSlug,
    span: Span,
}

impl BucketStep {
    pub const NAME: &'static str = "bucket";

    pub fn new(storage: Arc<dyn ObjectStorage>, slug: TenantSlug, span: Span) -> Self {
        Self { storage, slug, span }
    }
}

#[async_trait]
impl Step for BucketStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.storage
            .create_bucket(&self.slug)
            .await
            .with_context(|| format!("create bucket {}", self.slug.bucket_name()))?;
        info!(parent: &self.span, bucket = %self.slug.bucket_name(), "tenant bucket created");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let result = self.storage.delete_bucket(&self.slug).await;
        tolerate_missing(&self.span, Self::NAME, result)
            .with_context(|| format!("delete bucket {}", self.slug.bucket_name()))?;
        Ok(())
    }
}

pub struct AdminUserStep {
    users: Arc<dyn UserDirectory>,
    slug: TenantSlug,
    email: AdminEmail,
    span: Span,
}

impl AdminUserStep {
    pub const NAME: &'static str = "admin_user";

    pub fn new(users: Arc<dyn UserDirectory>, slug: TenantSlug, email: AdminEmail, span: Span) -> Self {
        Self {
            users,
            slug,
            email,
            span,
        }
    }
}

#[async_trait]
impl Step for AdminUserStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.users
            .create_admin_user(&self.slug, &self.email)
            .await
            .with_context(|| format!("create administrator {}", self.email))?;
        info!(parent: &self.span, "initial administrator created");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let result = self.users.delete_admin_user(&self.slug, &self.email).await;
        tolerate_missing(&self.span, Self::NAME, result)
            .with_context(|| format!("delete administrator {}", self.email))?;
        Ok(())
    }
}

pub struct InvitationStep {
    invitations: Arc<dyn InvitationService>,
    slug: TenantSlug,
    email: AdminEmail,
    span: Span,
}

impl InvitationStep {
    pub const NAME: &'static str = "invitation";

    pub fn new(
        invitations: Arc<dyn InvitationService>,
        slug: TenantSlug,
        email: AdminEmail,
        span: Span,
    ) -> Self {
        Self {
            invitations,
            slug,
            email,
            span,
        }
    }
}

#[async_trait]
impl Step for InvitationStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.invitations
            .send_invitation(&self.slug, &self.email)
            .await
            .with_context(|| format!("send invitation to {}", self.email))?;
        info!(parent: &self.span, "administrator invitation issued");
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        match self.invitations.revoke_invitation(&self.slug, &self.email).await {
            Ok(Revocation::Revoked) => Ok(()),
            Ok(Revocation::AlreadyAccepted) => {
                warn!(parent: &self.span, step = Self::NAME, "invitation already accepted; leaving it in place");
                Ok(())
            }
            Err(err) => tolerate_missing(&self.span, Self::NAME, Err(err))
                .with_context(|| format!("revoke invitation for {}", self.email)),
        }
    }
}
