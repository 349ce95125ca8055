//! Infrastructure layer: backend adapters, provisioning steps, run storage,
//! configuration, and the provisioning service that ties them together.

/// Configuration loading and representation.
pub mod config;

/// External service clients/adapters.
pub mod external;

/// Run record persistence.
pub mod runs;

/// Tenant provisioning steps and their factory.
pub mod saga;

pub mod provisioner;


pub use config::{ConfigError, PlatformConfig, log_format_from_env};
pub use provisioner::{ProvisionError, TenantProvisioner};
pub use runs::{InMemoryRunStore, PostgresRunStore, Reconciliation, RunStore, RunStoreError};
pub use saga::{StepKind, TenantStepFactory};
