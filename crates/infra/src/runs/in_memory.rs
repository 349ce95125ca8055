use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use tenantforge_core::{AggregateRoot, ExpectedVersion, RunId, TenantSlug};
use tenantforge_saga::{ProvisioningRun, RunStatus};

use super::{Reconciliation, RunStore, RunStoreError};

#[derive(Debug, Default)]
struct Runs {
    by_id: HashMap<RunId, ProvisioningRun>,
    /// Run ids per slug in the order they were opened.
    by_slug: HashMap<TenantSlug, Vec<RunId>>,
    /// Insertion order across all runs.
    order: Vec<RunId>,
    reconciliations: HashMap<RunId, Reconciliation>,
}

impl Runs {
    fn for_slug(&self, slug: &TenantSlug) -> impl DoubleEndedIterator<Item = &ProvisioningRun> {
        self.by_slug
            .get(slug)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    fn latest(&self, slug: &TenantSlug) -> Option<&ProvisioningRun> {
        self.for_slug(slug).next_back()
    }

    fn is_tainted(&self, slug: &TenantSlug) -> bool {
        self.for_slug(slug)
            .any(|r| r.requires_operator_action() && !self.reconciliations.contains_key(&r.id()))
    }
}

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<Runs>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> RunStoreError {
    RunStoreError::Storage("run store lock poisoned".to_string())
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &ProvisioningRun, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;

        let stored_version = runs.by_id.get(&run.id()).map(|r| r.version());
        if expected == ExpectedVersion::New && stored_version.is_some() {
            return Err(RunStoreError::AlreadyExists(run.id()));
        }
        expected
            .check(stored_version)
            .map_err(|e| RunStoreError::Conflict(e.to_string()))?;

        if stored_version.is_none() {
            if let Some(active) = runs.latest(run.tenant_slug()) {
                if !active.is_terminal() {
                    return Err(RunStoreError::SlugBusy(run.tenant_slug().clone()));
                }
            }
            runs.by_slug
                .entry(run.tenant_slug().clone())
                .or_default()
                .push(run.id());
            runs.order.push(run.id());
        }
        runs.by_id.insert(run.id(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<ProvisioningRun>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.by_id.get(&run_id).cloned())
    }

    async fn latest_for_slug(&self, slug: &TenantSlug) -> Result<Option<ProvisioningRun>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.latest(slug).cloned())
    }

    async fn runs_for_slug(&self, slug: &TenantSlug) -> Result<Vec<ProvisioningRun>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.for_slug(slug).cloned().collect())
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<ProvisioningRun>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs
            .order
            .iter()
            .filter_map(|id| runs.by_id.get(id))
            .filter(|r| r.status() == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn tainted_slugs(&self) -> Result<Vec<TenantSlug>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut slugs: Vec<TenantSlug> = runs
            .by_slug
            .keys()
            .filter(|slug| runs.is_tainted(slug))
            .cloned()
            .collect();
        slugs.sort();
        Ok(slugs)
    }

    async fn clear_taint(&self, run_id: RunId, note: &str) -> Result<Reconciliation, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let run = runs.by_id.get(&run_id).ok_or(RunStoreError::NotFound(run_id))?;
        if !run.requires_operator_action() {
            return Err(RunStoreError::NotTainted(run_id));
        }

        let reconciliation = Reconciliation {
            run_id,
            note: note.to_string(),
            cleared_at: Utc::now(),
        };
        runs.reconciliations
            .insert(run_id, reconciliation.clone());
        Ok(reconciliation)
    }

    async fn reconciliation(&self, run_id: RunId) -> Result<Option<Reconciliation>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.reconciliations.get(&run_id).cloned())
    }
}
