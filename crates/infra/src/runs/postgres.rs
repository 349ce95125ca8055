//! Postgres-backed run store.
//!
//! Each run is one row in `provisioning_runs`: the full record as JSONB plus
//! the columns queries filter on (slug, status, version). Operator sign-offs
//! live in `run_reconciliations`, keyed by run id, so run rows are never
//! rewritten after they reach a terminal status.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RunStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Decode / ColumnDecode | N/A | `Storage` |
//! | PoolClosed / Io / Tls / timeouts | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use tenantforge_core::{AggregateRoot, ExpectedVersion, RunId, TenantSlug};
use tenantforge_saga::{ProvisioningRun, RunStatus};

use super::{Reconciliation, RunStore, RunStoreError};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS provisioning_runs (
        run_id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        tenant_slug TEXT NOT NULL,
        status TEXT NOT NULL,
        version BIGINT NOT NULL CHECK (version > 0),
        run JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS provisioning_runs_slug_idx ON provisioning_runs (tenant_slug, seq)",
    "CREATE INDEX IF NOT EXISTS provisioning_runs_status_idx ON provisioning_runs (status, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS run_reconciliations (
        run_id UUID PRIMARY KEY REFERENCES provisioning_runs (run_id),
        note TEXT NOT NULL,
        cleared_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Statuses a run can still leave. At most one run per slug may be in one.
const OPEN_STATUSES: [RunStatus; 4] = [
    RunStatus::Pending,
    RunStatus::Running,
    RunStatus::Failed,
    RunStatus::RollingBack,
];

/// Run store shared by every provisioner process pointed at the same database.
///
/// Inserts for one slug are serialized with a transaction-scoped advisory lock
/// so the one-open-run rule holds across processes.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the run tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), RunStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, run), fields(run_id = %run.id(), tenant = %run.tenant_slug(), status = %run.status()), err)]
    async fn save(&self, run: &ProvisioningRun, expected: ExpectedVersion) -> Result<(), RunStoreError> {
        let run_id = *run.id().as_uuid();
        let slug = run.tenant_slug().as_str();

        // Dropping `tx` on an early return rolls it back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_slug(&mut tx, slug).await?;

        let stored_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM provisioning_runs WHERE run_id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save", e))?;
        let stored_version = stored_version.map(|v| v as u64);

        if expected == ExpectedVersion::New && stored_version.is_some() {
            return Err(RunStoreError::AlreadyExists(run.id()));
        }
        expected
            .check(stored_version)
            .map_err(|e| RunStoreError::Conflict(e.to_string()))?;

        if stored_version.is_none() {
            let busy: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM provisioning_runs WHERE tenant_slug = $1 AND status = ANY($2))",
            )
            .bind(slug)
            .bind(open_statuses())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
            if busy {
                return Err(RunStoreError::SlugBusy(run.tenant_slug().clone()));
            }

            sqlx::query(
                r#"
                INSERT INTO provisioning_runs (run_id, tenant_slug, status, version, run, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(run_id)
            .bind(slug)
            .bind(run.status().as_str())
            .bind(run.version() as i64)
            .bind(Json(run))
            .bind(run.created_at())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
        } else {
            sqlx::query(
                r#"
                UPDATE provisioning_runs
                SET status = $2, version = $3, run = $4, updated_at = now()
                WHERE run_id = $1
                "#,
            )
            .bind(run_id)
            .bind(run.status().as_str())
            .bind(run.version() as i64)
            .bind(Json(run))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, run_id: RunId) -> Result<Option<ProvisioningRun>, RunStoreError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT run FROM provisioning_runs WHERE run_id = $1")
            .bind(*run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self), fields(tenant = %slug), err)]
    async fn latest_for_slug(&self, slug: &TenantSlug) -> Result<Option<ProvisioningRun>, RunStoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT run FROM provisioning_runs WHERE tenant_slug = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(slug.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_for_slug", e))?;
        Ok(row.map(RunRow::into_run))
    }

    #[instrument(skip(self), fields(tenant = %slug), err)]
    async fn runs_for_slug(&self, slug: &TenantSlug) -> Result<Vec<ProvisioningRun>, RunStoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT run FROM provisioning_runs WHERE tenant_slug = $1 ORDER BY seq",
        )
        .bind(slug.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("runs_for_slug", e))?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<ProvisioningRun>, RunStoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT run FROM provisioning_runs WHERE status = $1 ORDER BY seq LIMIT $2",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    #[instrument(skip(self), err)]
    async fn tainted_slugs(&self) -> Result<Vec<TenantSlug>, RunStoreError> {
        let raw: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT r.tenant_slug
            FROM provisioning_runs r
            LEFT JOIN run_reconciliations c ON c.run_id = r.run_id
            WHERE r.status = $1 AND c.run_id IS NULL
            "#,
        )
        .bind(RunStatus::RollbackFailed.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tainted_slugs", e))?;

        let mut slugs = raw
            .iter()
            .map(|s| TenantSlug::parse(s).map_err(|e| RunStoreError::Storage(format!("stored slug {s:?}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        slugs.sort();
        Ok(slugs)
    }

    #[instrument(skip(self, note), err)]
    async fn clear_taint(&self, run_id: RunId, note: &str) -> Result<Reconciliation, RunStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM provisioning_runs WHERE run_id = $1 FOR UPDATE")
                .bind(*run_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("clear_taint", e))?;
        match status.as_deref() {
            None => return Err(RunStoreError::NotFound(run_id)),
            Some(s) if s != RunStatus::RollbackFailed.as_str() => {
                debug!(status = s, "run is not tainted");
                return Err(RunStoreError::NotTainted(run_id));
            }
            Some(_) => {}
        }

        let row = sqlx::query_as::<_, ReconciliationRow>(
            r#"
            INSERT INTO run_reconciliations (run_id, note, cleared_at)
            VALUES ($1, $2, now())
            ON CONFLICT (run_id) DO UPDATE
                SET note = EXCLUDED.note, cleared_at = EXCLUDED.cleared_at
            RETURNING run_id, note, cleared_at
            "#,
        )
        .bind(*run_id.as_uuid())
        .bind(note)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_taint", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(row.into())
    }

    #[instrument(skip(self), err)]
    async fn reconciliation(&self, run_id: RunId) -> Result<Option<Reconciliation>, RunStoreError> {
        let row = sqlx::query_as::<_, ReconciliationRow>(
            "SELECT run_id, note, cleared_at FROM run_reconciliations WHERE run_id = $1",
        )
        .bind(*run_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reconciliation", e))?;
        Ok(row.map(Reconciliation::from))
    }
}

/// Serializes run inserts for one slug until the transaction ends.
async fn lock_slug(tx: &mut Transaction<'_, Postgres>, slug: &str) -> Result<(), RunStoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(slug)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_slug", e))?;
    Ok(())
}

fn open_statuses() -> Vec<String> {
    OPEN_STATUSES.iter().map(|s| s.as_str().to_string()).collect()
}

struct RunRow {
    run: Json<ProvisioningRun>,
}

impl RunRow {
    fn into_run(self) -> ProvisioningRun {
        self.run.0
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for RunRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            run: row.try_get("run")?,
        })
    }
}

struct ReconciliationRow {
    run_id: Uuid,
    note: String,
    cleared_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ReconciliationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReconciliationRow {
            run_id: row.try_get("run_id")?,
            note: row.try_get("note")?,
            cleared_at: row.try_get("cleared_at")?,
        })
    }
}

impl From<ReconciliationRow> for Reconciliation {
    fn from(row: ReconciliationRow) -> Self {
        Reconciliation {
            run_id: RunId::from_uuid(row.run_id),
            note: row.note,
            cleared_at: row.cleared_at,
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RunStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RunStoreError::Conflict(msg),
                _ => RunStoreError::Storage(msg),
            }
        }
        _ => RunStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryPlatform;
    use crate::saga::TenantStepFactory;
    use sqlx::postgres::PgPoolOptions;
    use tenantforge_core::ProvisioningRequest;
    use tenantforge_saga::SagaRunner;
    use tracing::Span;

    #[test]
    fn open_statuses_are_exactly_the_non_terminal_ones() {
        let all = [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::RollingBack,
            RunStatus::RolledBack,
            RunStatus::RollbackFailed,
        ];
        let expected: Vec<String> = all
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();
        assert_eq!(open_statuses(), expected);
    }

    #[test]
    fn transport_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolClosed),
            RunStoreError::Storage(msg) if msg.contains("get")
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            RunStoreError::Storage(_)
        ));
    }

    #[tokio::test]
    #[ignore = "requires a Postgres database in DATABASE_URL"]
    async fn runs_survive_a_new_store_instance() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPoolOptions::new().max_connections(2).connect(&url).await.unwrap();
        let store = PostgresRunStore::new(pool.clone());
        store.ensure_schema().await.unwrap();

        let slug = format!("pg-{}", &Uuid::now_v7().simple().to_string()[20..]);
        let request = ProvisioningRequest::new(&slug, "Acme Corp", "owner@acme.test").unwrap();
        let factory = TenantStepFactory::single_backend(Arc::new(InMemoryPlatform::new()), Span::none());
        let plan = factory.build(&request);
        let pending = ProvisioningRun::for_request(&request, &plan);
        store.save(&pending, ExpectedVersion::New).await.unwrap();

        let reopened = PostgresRunStore::new(pool);
        let second = ProvisioningRun::for_request(&request, &factory.build(&request));
        assert_eq!(
            reopened.save(&second, ExpectedVersion::New).await,
            Err(RunStoreError::SlugBusy(request.slug().clone()))
        );

        let done = SagaRunner::new(Span::none()).run(pending.clone(), plan).await;
        reopened
            .save(&done, ExpectedVersion::Exact(pending.version()))
            .await
            .unwrap();
        assert_eq!(reopened.get(done.id()).await.unwrap(), Some(done.clone()));
        assert_eq!(
            reopened.runs_for_slug(request.slug()).await.unwrap(),
            vec![done]
        );
    }
}
