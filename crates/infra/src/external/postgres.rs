//! Postgres-backed adapters: tenant schemas and administrator invitations.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | BackendError |
//! |------------|----------------------|--------------|
//! | Database (duplicate schema) | `42P06` | `AlreadyExists` |
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other, e.g. `42501` insufficient privilege) | Any other | `Rejected` |
//! | PoolClosed / Io / Tls / timeouts | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use tenantforge_core::{AdminEmail, TenantSlug};

use super::{BackendError, InvitationService, Revocation, SchemaManager};

/// Creates and drops one schema per tenant (`tenant_<slug>`).
#[derive(Debug, Clone)]
pub struct PostgresSchemaManager {
    pool: Arc<PgPool>,
}

impl PostgresSchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool, BackendError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1) AS present",
        )
        .bind(schema)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schema_exists", e))?;

        row.try_get::<bool, _>("present")
            .map_err(|e| map_sqlx_error("schema_exists", e))
    }
}

#[async_trait]
impl SchemaManager for PostgresSchemaManager {
    #[instrument(skip(self), fields(schema = %slug.schema_name()), err)]
    async fn create_schema(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        // Schema names are derived from validated slugs ([a-z0-9_] only), so
        // quoting is enough; identifiers cannot be bound as parameters.
        let sql = format!("CREATE SCHEMA \"{}\"", slug.schema_name());
        sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(schema = %slug.schema_name()), err)]
    async fn drop_schema(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let schema = slug.schema_name();
        if !self.schema_exists(&schema).await? {
            return Err(BackendError::NotFound(format!("schema {schema}")));
        }

        let sql = format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE");
        sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("drop_schema", e))?;
        Ok(())
    }
}

/// Invitation records in the shared `tenant_invitations` table.
///
/// Delivery (email) is driven from this table by a separate mailer; a row in
/// `pending` state is what makes an invitation usable.
#[derive(Debug, Clone)]
pub struct PostgresInvitationStore {
    pool: Arc<PgPool>,
}

impl PostgresInvitationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the invitations table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_invitations (
                tenant_slug TEXT NOT NULL,
                email TEXT NOT NULL,
                token UUID NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'revoked')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (tenant_slug, email)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(())
    }
}

#[async_trait]
impl InvitationService for PostgresInvitationStore {
    #[instrument(skip(self, email), fields(tenant = %slug), err)]
    async fn send_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        // A revoked invitation (from an earlier rolled-back run) may be reissued.
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_invitations (tenant_slug, email, token, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (tenant_slug, email) DO UPDATE
                SET token = EXCLUDED.token, status = 'pending', updated_at = now()
                WHERE tenant_invitations.status = 'revoked'
            "#,
        )
        .bind(slug.as_str())
        .bind(email.as_str())
        .bind(Uuid::now_v7())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("send_invitation", e))?;

        if result.rows_affected() == 0 {
            return Err(BackendError::AlreadyExists(format!(
                "invitation for {email} in {slug}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, email), fields(tenant = %slug), err)]
    async fn revoke_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<Revocation, BackendError> {
        let updated = sqlx::query(
            r#"
            UPDATE tenant_invitations
            SET status = 'revoked', updated_at = now()
            WHERE tenant_slug = $1 AND email = $2 AND status = 'pending'
            "#,
        )
        .bind(slug.as_str())
        .bind(email.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("revoke_invitation", e))?;

        if updated.rows_affected() > 0 {
            return Ok(Revocation::Revoked);
        }

        let status: Option<String> = sqlx::query(
            "SELECT status FROM tenant_invitations WHERE tenant_slug = $1 AND email = $2",
        )
        .bind(slug.as_str())
        .bind(email.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("revoke_invitation", e))?
        .map(|row| row.try_get::<String, _>("status"))
        .transpose()
        .map_err(|e| map_sqlx_error("revoke_invitation", e))?;

        debug!(?status, "invitation was not pending");
        match status.as_deref() {
            None => Err(BackendError::NotFound(format!("invitation for {email} in {slug}"))),
            Some("accepted") => Ok(Revocation::AlreadyAccepted),
            Some(_) => Ok(Revocation::Revoked),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P06") | Some("23505") => BackendError::AlreadyExists(msg),
                _ => BackendError::Rejected(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            BackendError::NotFound(format!("unexpected row not found in {operation}"))
        }
        _ => BackendError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
