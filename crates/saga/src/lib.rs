//! Saga mechanics for tenant provisioning (framework only, no backends).
//!
//! - A `Step` is one forward action against one external system plus its undo
//! - A `StepPlan` is the ordered list of steps for one tenant
//! - A `ProvisioningRun` is the observable record of one attempt
//! - The `SagaRunner` executes a plan sequentially and compensates in reverse
//!   order on failure
//!
//! Concrete steps and the factory that orders them live in `tenantforge-infra`.

pub mod cancel;
pub mod error;
pub mod outcome;
pub mod run;
pub mod runner;
pub mod step;

pub use cancel::{CancellationHandle, CancellationSignal, cancellation};
pub use error::{RollbackError, RunError, StepExecutionError};
pub use outcome::{OutcomeKind, StepOutcome, StepPhase};
pub use run::{ProvisioningRun, RunStatus, StatusChange};
pub use runner::SagaRunner;
pub use step::{RollbackKind, Step, StepPlan};
