//! `tenantforge-core`: domain building blocks shared by the provisioning crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the validated tenant values a
//! provisioning request is made of.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod request;
pub mod tenant;
pub mod value_object;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{RunId, TenantId};
pub use request::ProvisioningRequest;
pub use tenant::{AdminEmail, TenantName, TenantSlug};
pub use value_object::ValueObject;
