//! Persistence for provisioning run records.
//!
//! A store keeps every run ever attempted, keyed by run id, plus the order in
//! which runs were opened per tenant slug. It enforces one structural rule of
//! its own: a slug never has two non-terminal runs at the same time.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantforge_core::{ExpectedVersion, RunId, TenantSlug};
use tenantforge_saga::{ProvisioningRun, RunStatus};

pub use in_memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;

/// Run store abstraction.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert (`ExpectedVersion::New`) or replace a run.
    ///
    /// Replacing checks the stored version against `expected`. Inserting fails
    /// with `SlugBusy` while another run for the same slug is not terminal.
    async fn save(&self, run: &ProvisioningRun, expected: ExpectedVersion) -> Result<(), RunStoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<ProvisioningRun>, RunStoreError>;

    /// Most recently opened run for `slug`.
    async fn latest_for_slug(&self, slug: &TenantSlug) -> Result<Option<ProvisioningRun>, RunStoreError>;

    /// Every run opened for `slug`, oldest first.
    async fn runs_for_slug(&self, slug: &TenantSlug) -> Result<Vec<ProvisioningRun>, RunStoreError>;

    /// Runs in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<ProvisioningRun>, RunStoreError>;

    /// Slugs with at least one `RollbackFailed` run that has not been reconciled.
    async fn tainted_slugs(&self) -> Result<Vec<TenantSlug>, RunStoreError>;

    /// Record that an operator cleaned up after a `RollbackFailed` run.
    ///
    /// The run record itself is left untouched.
    async fn clear_taint(&self, run_id: RunId, note: &str) -> Result<Reconciliation, RunStoreError>;

    async fn reconciliation(&self, run_id: RunId) -> Result<Option<Reconciliation>, RunStoreError>;
}

/// Operator sign-off on a failed compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub run_id: RunId,
    pub note: String,
    pub cleared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),
    #[error("version conflict: {0}")]
    Conflict(String),
    #[error("tenant {0} already has a run in progress")]
    SlugBusy(TenantSlug),
    #[error("run {0} did not fail its rollback; nothing to clear")]
    NotTainted(RunId),
    #[error("storage error: {0}")]
    Storage(String),
}
