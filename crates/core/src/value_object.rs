//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. In this
/// workspace they are the validated pieces of a provisioning request
/// (`TenantSlug`, `TenantName`, `AdminEmail`): once constructed they are known
/// to be well-formed, so steps bound to them never re-validate.
///
/// ```ignore
/// let a = TenantSlug::parse("acme")?;
/// let b = TenantSlug::parse("acme")?;
/// assert_eq!(a, b);
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
