use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use tenantforge_core::ProvisioningRequest;
use tenantforge_infra::external::{
    KeycloakAdmin, LocalObjectStorage, PostgresInvitationStore, PostgresSchemaManager,
};
use tenantforge_infra::{
    PlatformConfig, PostgresRunStore, TenantProvisioner, TenantStepFactory, log_format_from_env,
};
use tenantforge_saga::{RunStatus, cancellation};

/// Provision one tenant: schema, realm, clients, roles, bucket, admin user, invitation.
///
/// Prints the run record as JSON and exits non-zero unless the run completed.
#[derive(Parser)]
#[command(name = "tenantforge-provisioner", version)]
struct Cli {
    /// Tenant slug (lowercase letters, digits and `-`)
    slug: String,
    /// Tenant display name
    name: String,
    /// Email of the tenant's first administrator
    admin_email: String,
    /// Commercial plan recorded on the request
    #[arg(long)]
    plan: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let format = log_format_from_env().context("loading configuration")?;
    tenantforge_observability::init_with(format);

    let config = PlatformConfig::from_env().context("loading configuration")?;

    let mut request = ProvisioningRequest::new(&cli.slug, &cli.name, &cli.admin_email)
        .context("invalid provisioning request")?;
    if let Some(plan) = cli.plan {
        request = request.with_plan(plan);
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;

    let runs = PostgresRunStore::new(pool.clone());
    runs.ensure_schema()
        .await
        .context("preparing run tables")?;
    let invitations = PostgresInvitationStore::new(pool.clone());
    invitations
        .ensure_table()
        .await
        .context("preparing invitations table")?;
    let keycloak = Arc::new(KeycloakAdmin::new(config.keycloak.clone()));

    let span = tracing::info_span!("tenantforge_provisioner");
    let factory = TenantStepFactory::new(
        Arc::new(PostgresSchemaManager::new(pool)),
        keycloak.clone(),
        Arc::new(LocalObjectStorage::new(config.object_storage_root.clone())),
        keycloak,
        Arc::new(invitations),
        span.clone(),
    );
    let provisioner = TenantProvisioner::new(factory, Arc::new(runs), span);

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling after the current step");
            handle.cancel();
        }
    });

    let run = provisioner
        .provision_with_cancellation(&request, &signal)
        .await?;

    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.status() == RunStatus::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
