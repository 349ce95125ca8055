//! Environment-driven configuration for the provisioning service.
//!
//! | Variable | Required | Default |
//! |----------|----------|---------|
//! | `DATABASE_URL` | yes | |
//! | `KEYCLOAK_URL` | yes | |
//! | `KEYCLOAK_ADMIN_REALM` | no | `master` |
//! | `KEYCLOAK_CLIENT_ID` | no | `admin-cli` |
//! | `KEYCLOAK_CLIENT_SECRET` | yes | |
//! | `TENANT_CLIENTS` | no | `web,api` |
//! | `TENANT_ROLES` | no | `tenant_admin,tenant_member` |
//! | `OBJECT_STORAGE_ROOT` | no | `./data/buckets` |
//! | `LOG_FORMAT` | no | `json` |

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use tenantforge_observability::{LogFormat, UnknownLogFormat};

use crate::external::KeycloakConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub database_url: String,
    pub keycloak: KeycloakConfig,
    pub object_storage_root: PathBuf,
}

/// `LOG_FORMAT`, read on its own so logging can be set up before anything
/// else is loaded.
pub fn log_format_from_env() -> Result<LogFormat, ConfigError> {
    log_format_from_lookup(|key| std::env::var(key).ok())
}

pub fn log_format_from_lookup<F>(lookup: F) -> Result<LogFormat, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("LOG_FORMAT").filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.parse().map_err(|e: UnknownLogFormat| ConfigError::Invalid {
            var: "LOG_FORMAT",
            reason: e.to_string(),
        }),
        None => Ok(LogFormat::default()),
    }
}

impl PlatformConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let or_default = |key: &'static str, default: &str| {
            get(key).unwrap_or_else(|| {
                warn!(variable = key, default, "not set; using default");
                default.to_string()
            })
        };

        let tenant_clients = split_list("TENANT_CLIENTS", &or_default("TENANT_CLIENTS", "web,api"))?;
        let tenant_roles = split_list(
            "TENANT_ROLES",
            &or_default("TENANT_ROLES", "tenant_admin,tenant_member"),
        )?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            keycloak: KeycloakConfig {
                base_url: required("KEYCLOAK_URL")?,
                admin_realm: or_default("KEYCLOAK_ADMIN_REALM", "master"),
                client_id: or_default("KEYCLOAK_CLIENT_ID", "admin-cli"),
                client_secret: required("KEYCLOAK_CLIENT_SECRET")?,
                tenant_clients,
                tenant_roles,
            },
            object_storage_root: PathBuf::from(or_default("OBJECT_STORAGE_ROOT", "./data/buckets")),
        })
    }
}

fn split_list(var: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        return Err(ConfigError::Invalid {
            var,
            reason: "expected a comma-separated list".to_string(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("DATABASE_URL", "postgres://localhost/tenantforge"),
        ("KEYCLOAK_URL", "http://localhost:8081"),
        ("KEYCLOAK_CLIENT_SECRET", "s3cret"),
    ];

    #[test]
    fn defaults_fill_optional_values() {
        let cfg = PlatformConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(cfg.keycloak.admin_realm, "master");
        assert_eq!(cfg.keycloak.client_id, "admin-cli");
        assert_eq!(cfg.keycloak.tenant_clients, vec!["web", "api"]);
        assert_eq!(cfg.keycloak.tenant_roles, vec!["tenant_admin", "tenant_member"]);
        assert_eq!(cfg.object_storage_root, PathBuf::from("./data/buckets"));
    }

    #[test]
    fn missing_required_value_is_reported_by_name() {
        let err = PlatformConfig::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("KEYCLOAK_CLIENT_SECRET"));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("DATABASE_URL", "  ");
        let err = PlatformConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn lists_are_trimmed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("TENANT_CLIENTS", " portal , ,mobile "));
        let cfg = PlatformConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.keycloak.tenant_clients, vec!["portal", "mobile"]);
    }

    #[test]
    fn log_format_defaults_to_json_and_rejects_unknown_values() {
        assert_eq!(log_format_from_lookup(lookup(&[])), Ok(LogFormat::Json));
        assert_eq!(log_format_from_lookup(lookup(&[("LOG_FORMAT", " ")])), Ok(LogFormat::Json));
        assert_eq!(
            log_format_from_lookup(lookup(&[("LOG_FORMAT", "pretty")])),
            Ok(LogFormat::Pretty)
        );
        assert!(matches!(
            log_format_from_lookup(lookup(&[("LOG_FORMAT", "xml")])),
            Err(ConfigError::Invalid { var: "LOG_FORMAT", .. })
        ));
    }

    #[test]
    fn bad_lists_are_invalid() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("TENANT_ROLES", ",,"));
        assert!(matches!(
            PlatformConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { var: "TENANT_ROLES", .. })
        ));
    }
}
