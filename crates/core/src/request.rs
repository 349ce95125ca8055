//! Provisioning request: the immutable input of one provisioning attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::id::TenantId;
use crate::tenant::{AdminEmail, TenantName, TenantSlug};

/// Everything needed to provision one tenant.
///
/// Built once per attempt and never mutated afterwards; steps copy the values
/// they need at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    tenant_id: TenantId,
    slug: TenantSlug,
    name: TenantName,
    admin_email: AdminEmail,
    plan: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl ProvisioningRequest {
    /// Validate raw inputs into a request.
    ///
    /// Fails with `DomainError::Validation` on the first malformed field; no
    /// partially-valid request is ever returned.
    pub fn new(slug: &str, name: &str, admin_email: &str) -> DomainResult<Self> {
        Ok(Self {
            tenant_id: TenantId::new(),
            slug: TenantSlug::parse(slug)?,
            name: TenantName::parse(name)?,
            admin_email: AdminEmail::parse(admin_email)?,
            plan: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn slug(&self) -> &TenantSlug {
        &self.slug
    }

    pub fn name(&self) -> &TenantName {
        &self.name
    }

    pub fn admin_email(&self) -> &AdminEmail {
        &self.admin_email
    }

    pub fn plan(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    #[test]
    fn builds_a_valid_request() {
        let req = ProvisioningRequest::new("acme", "Acme Inc", "ops@acme.example")
            .unwrap()
            .with_plan("enterprise")
            .with_metadata("region", "eu-west-1");

        assert_eq!(req.slug().as_str(), "acme");
        assert_eq!(req.name().as_str(), "Acme Inc");
        assert_eq!(req.admin_email().as_str(), "ops@acme.example");
        assert_eq!(req.plan(), Some("enterprise"));
        assert_eq!(req.metadata().get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn any_invalid_field_rejects_the_whole_request() {
        assert!(matches!(
            ProvisioningRequest::new("ACME", "Acme", "ops@acme.example"),
            Err(DomainError::Validation(_))
        ));
        assert!(ProvisioningRequest::new("acme", "", "ops@acme.example").is_err());
        assert!(ProvisioningRequest::new("acme", "Acme", "not-an-email").is_err());
    }
}
