//! External service boundaries used by the provisioning steps.
//!
//! Each trait is the narrow capability one step needs from one backend. The
//! adapters in this module implement them against real systems (Postgres,
//! Keycloak, a local object-storage root) or in memory for tests/dev.
//!
//! ## Idempotence contract
//!
//! Delete operations report a missing target as `BackendError::NotFound`
//! rather than hiding it; the steps decide that a missing target during
//! rollback is a warning, not a failure.

pub mod in_memory;
pub mod keycloak;
pub mod local_storage;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use tenantforge_core::{AdminEmail, TenantName, TenantSlug};

pub use in_memory::InMemoryPlatform;
pub use keycloak::{KeycloakAdmin, KeycloakConfig};
pub use local_storage::LocalObjectStorage;
pub use postgres::{PostgresInvitationStore, PostgresSchemaManager};

/// Backend failure as seen by a step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The backend refused the request (bad input, policy, state conflict).
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transport failure, timeout, or backend outage.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Per-tenant database schema management.
#[async_trait]
pub trait SchemaManager: Send + Sync {
    async fn create_schema(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    async fn drop_schema(&self, slug: &TenantSlug) -> Result<(), BackendError>;
}

/// Identity-provider administration for one tenant realm.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_realm(&self, slug: &TenantSlug, name: &TenantName) -> Result<(), BackendError>;
    /// Deleting the realm also removes its clients, roles and users.
    async fn delete_realm(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    async fn create_clients(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    async fn delete_clients(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    async fn provision_roles(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    async fn configure_refresh_rotation(&self, slug: &TenantSlug) -> Result<(), BackendError>;
}

/// Tenant-scoped object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError>;
    /// Removes the bucket together with its contents.
    async fn delete_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError>;
}

/// Tenant user accounts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn create_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError>;
    async fn delete_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError>;
}

/// Whether a revoke call actually invalidated something.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Revocation {
    Revoked,
    /// The invitee already accepted; there is nothing left to revoke.
    AlreadyAccepted,
}

/// Administrator invitations.
#[async_trait]
pub trait InvitationService: Send + Sync {
    async fn send_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError>;
    async fn revoke_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<Revocation, BackendError>;
}
