//! Validated tenant values: slug, display name, administrator email.
//!
//! A slug ends up in places with very different naming rules: a URL path
//! segment, a Postgres schema identifier, an identity-provider realm name and
//! an object-storage bucket name. The accepted alphabet is the intersection of
//! those rules; backend-specific names are derived from it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

const SLUG_MIN_LEN: usize = 3;
const SLUG_MAX_LEN: usize = 63;
const NAME_MAX_LEN: usize = 200;

/// Slugs that collide with names the backends reserve for themselves.
const RESERVED_SLUGS: &[&str] = &[
    "master",
    "admin",
    "public",
    "system",
    "information_schema",
    "pg_catalog",
    "www",
    "api",
];

/// Unique, URL- and schema-safe tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantSlug(String);

impl TenantSlug {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let slug = raw.trim();

        if slug.len() < SLUG_MIN_LEN || slug.len() > SLUG_MAX_LEN {
            return Err(DomainError::validation(format!(
                "tenant slug must be {SLUG_MIN_LEN}-{SLUG_MAX_LEN} characters, got {}",
                slug.len()
            )));
        }
        if !slug.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(DomainError::validation(
                "tenant slug must start with a lowercase letter",
            ));
        }
        if let Some(bad) = slug
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(DomainError::validation(format!(
                "tenant slug contains invalid character {bad:?}"
            )));
        }
        if slug.ends_with('-') || slug.contains("--") {
            return Err(DomainError::validation(
                "tenant slug must not end with '-' or contain '--'",
            ));
        }
        if RESERVED_SLUGS.contains(&slug) {
            return Err(DomainError::validation(format!(
                "tenant slug {slug:?} is reserved"
            )));
        }

        Ok(Self(slug.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Postgres schema holding the tenant's tables (`tenant_<slug>`, dashes
    /// replaced so the identifier never needs quoting).
    pub fn schema_name(&self) -> String {
        format!("tenant_{}", self.0.replace('-', "_"))
    }

    /// Identity-provider realm name.
    pub fn realm_name(&self) -> &str {
        &self.0
    }

    /// Object-storage bucket name.
    pub fn bucket_name(&self) -> String {
        format!("tenant-{}", self.0)
    }
}

impl ValueObject for TenantSlug {}

impl fmt::Display for TenantSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantSlug {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantSlug {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantSlug> for String {
    fn from(value: TenantSlug) -> Self {
        value.0
    }
}

/// Human-readable tenant display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantName(String);

impl TenantName {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(DomainError::validation("tenant name must not be empty"));
        }
        if name.chars().count() > NAME_MAX_LEN {
            return Err(DomainError::validation(format!(
                "tenant name must be at most {NAME_MAX_LEN} characters"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for TenantName {}

impl fmt::Display for TenantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantName> for String {
    fn from(value: TenantName) -> Self {
        value.0
    }
}

/// Email address of the tenant's initial administrator (normalized to
/// lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdminEmail(String);

impl AdminEmail {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let email = raw.trim().to_ascii_lowercase();

        let (local, domain) = email
            .split_once('@')
            .ok_or_else(|| DomainError::validation("admin email must contain '@'"))?;

        if local.is_empty() || domain.contains('@') {
            return Err(DomainError::validation(format!(
                "admin email {email:?} is malformed"
            )));
        }
        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(DomainError::validation(format!(
                "admin email domain {domain:?} is malformed"
            )));
        }
        if email.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(
                "admin email must not contain whitespace",
            ));
        }

        Ok(Self(email))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for AdminEmail {}

impl fmt::Display for AdminEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AdminEmail {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AdminEmail> for String {
    fn from(value: AdminEmail) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_simple_slugs() {
        let slug = TenantSlug::parse("acme").unwrap();
        assert_eq!(slug.as_str(), "acme");
        assert_eq!(slug.schema_name(), "tenant_acme");
        assert_eq!(slug.bucket_name(), "tenant-acme");
        assert_eq!(slug.realm_name(), "acme");
    }

    #[test]
    fn dashes_become_underscores_in_schema_name() {
        let slug = TenantSlug::parse("acme-eu-2").unwrap();
        assert_eq!(slug.schema_name(), "tenant_acme_eu_2");
    }

    #[test]
    fn rejects_malformed_slugs() {
        for raw in ["", "ab", "Acme", "1acme", "acme_corp", "acme-", "ac--me", "acme corp"] {
            assert!(
                matches!(TenantSlug::parse(raw), Err(DomainError::Validation(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_reserved_slugs() {
        let err = TenantSlug::parse("master").unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn slug_deserialization_validates() {
        let ok: TenantSlug = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantSlug>("\"NOPE\"").is_err());
    }

    #[test]
    fn tenant_name_is_trimmed_and_bounded() {
        assert_eq!(TenantName::parse("  Acme Inc ").unwrap().as_str(), "Acme Inc");
        assert!(TenantName::parse("   ").is_err());
        assert!(TenantName::parse(&"x".repeat(201)).is_err());
    }

    #[test]
    fn admin_email_is_normalized() {
        let email = AdminEmail::parse(" Ops@Acme.Example ").unwrap();
        assert_eq!(email.as_str(), "ops@acme.example");
    }

    #[test]
    fn rejects_malformed_emails() {
        for raw in ["ops", "@acme.example", "ops@acme", "ops@.acme", "ops@acme.", "a@b@c.de", "o ps@acme.io"] {
            assert!(AdminEmail::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: every accepted slug yields a schema name made only of
        /// characters Postgres accepts in an unquoted identifier.
        #[test]
        fn accepted_slugs_yield_unquoted_schema_names(raw in "[a-z][a-z0-9-]{0,70}") {
            if let Ok(slug) = TenantSlug::parse(&raw) {
                let schema = slug.schema_name();
                prop_assert!(schema.len() <= 70);
                prop_assert!(schema
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
                prop_assert!(!slug.as_str().ends_with('-'));
            }
        }

        /// Property: parsing is idempotent on accepted slugs.
        #[test]
        fn parse_is_idempotent(raw in "[a-z][a-z0-9]{2,20}") {
            prop_assume!(!RESERVED_SLUGS.contains(&raw.as_str()));
            let slug = TenantSlug::parse(&raw).unwrap();
            prop_assert_eq!(TenantSlug::parse(slug.as_str()).unwrap(), slug);
        }
    }
}
