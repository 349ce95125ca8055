//! Keycloak admin REST adapter (identity provider + user directory).
//!
//! Authenticates with the client-credentials grant against the admin realm and
//! caches the access token until shortly before it expires.
//!
//! HTTP status mapping: 404 → `NotFound`, 409 → `AlreadyExists`,
//! 5xx / transport errors → `Unavailable`, any other non-2xx → `Rejected`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use tenantforge_core::{AdminEmail, TenantName, TenantSlug};

use super::{BackendError, IdentityProvider, UserDirectory};

/// Refresh the cached token this long before Keycloak says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct KeycloakConfig {
    /// e.g. `https://id.example.com`
    pub base_url: String,
    pub admin_realm: String,
    pub client_id: String,
    pub client_secret: String,
    /// OIDC clients registered in every tenant realm.
    pub tenant_clients: Vec<String>,
    /// Realm roles created in every tenant realm.
    pub tenant_roles: Vec<String>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

pub struct KeycloakAdmin {
    http: Client,
    config: KeycloakConfig,
    token: Mutex<Option<CachedToken>>,
}

impl KeycloakAdmin {
    pub fn new(config: KeycloakConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, mut config: KeycloakConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}/admin/realms{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> Result<String, BackendError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.config.base_url, self.config.admin_realm
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| map_reqwest_error("token", e))?;
        let token: TokenResponse = check("token", response)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error("token", e))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        debug!("refreshed keycloak admin token");
        Ok(token.access_token)
    }

    async fn request(&self, method: Method, url: String) -> Result<RequestBuilder, BackendError> {
        let token = self.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(what, e))?;
        check(what, response).await
    }

    async fn find_ids(&self, what: &str, url: String, query: &[(&str, &str)]) -> Result<Vec<String>, BackendError> {
        let builder = self.request(Method::GET, url).await?.query(query);
        let found: Vec<IdOnly> = self
            .send(what, builder)
            .await?
            .json()
            .await
            .map_err(|e| map_reqwest_error(what, e))?;
        Ok(found.into_iter().map(|c| c.id).collect())
    }
}

async fn check(what: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let msg = format!("{what}: HTTP {status}: {body}");
    Err(match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(msg),
        StatusCode::CONFLICT => BackendError::AlreadyExists(msg),
        s if s.is_server_error() => BackendError::Unavailable(msg),
        _ => BackendError::Rejected(msg),
    })
}

fn map_reqwest_error(what: &str, err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Rejected(format!("{what}: unexpected response body: {err}"))
    } else {
        BackendError::Unavailable(format!("{what}: {err}"))
    }
}

#[async_trait]
impl IdentityProvider for KeycloakAdmin {
    #[instrument(skip(self, name), fields(realm = %slug), err)]
    async fn create_realm(&self, slug: &TenantSlug, name: &TenantName) -> Result<(), BackendError> {
        let builder = self
            .request(Method::POST, self.admin_url(""))
            .await?
            .json(&json!({
                "realm": slug.realm_name(),
                "displayName": name.as_str(),
                "enabled": true,
            }));
        self.send("create realm", builder).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(realm = %slug), err)]
    async fn delete_realm(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let url = self.admin_url(&format!("/{}", slug.realm_name()));
        let builder = self.request(Method::DELETE, url).await?;
        self.send("delete realm", builder).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(realm = %slug), err)]
    async fn create_clients(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let url = self.admin_url(&format!("/{}/clients", slug.realm_name()));
        for client_id in &self.config.tenant_clients {
            let builder = self
                .request(Method::POST, url.clone())
                .await?
                .json(&json!({
                    "clientId": client_id,
                    "enabled": true,
                    "protocol": "openid-connect",
                }));
            self.send("create client", builder).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(realm = %slug), err)]
    async fn delete_clients(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let base = self.admin_url(&format!("/{}/clients", slug.realm_name()));
        let mut deleted = 0usize;
        for client_id in &self.config.tenant_clients {
            let ids = self
                .find_ids("find client", base.clone(), &[("clientId", client_id.as_str())])
                .await?;
            for id in ids {
                let builder = self.request(Method::DELETE, format!("{base}/{id}")).await?;
                self.send("delete client", builder).await?;
                deleted += 1;
            }
        }
        if deleted == 0 {
            return Err(BackendError::NotFound(format!("clients in realm {slug}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(realm = %slug), err)]
    async fn provision_roles(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let url = self.admin_url(&format!("/{}/roles", slug.realm_name()));
        for role in &self.config.tenant_roles {
            let builder = self
                .request(Method::POST, url.clone())
                .await?
                .json(&json!({ "name": role }));
            self.send("create role", builder).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(realm = %slug), err)]
    async fn configure_refresh_rotation(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let url = self.admin_url(&format!("/{}", slug.realm_name()));
        let builder = self.request(Method::PUT, url).await?.json(&json!({
            "revokeRefreshToken": true,
            "refreshTokenMaxReuse": 0,
        }));
        self.send("configure refresh rotation", builder).await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for KeycloakAdmin {
    #[instrument(skip(self, email), fields(realm = %slug), err)]
    async fn create_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        let url = self.admin_url(&format!("/{}/users", slug.realm_name()));
        let builder = self.request(Method::POST, url).await?.json(&json!({
            "username": email.as_str(),
            "email": email.as_str(),
            "enabled": true,
            "emailVerified": false,
            "requiredActions": ["UPDATE_PASSWORD", "VERIFY_EMAIL"],
        }));
        self.send("create admin user", builder).await?;
        Ok(())
    }

    #[instrument(skip(self, email), fields(realm = %slug), err)]
    async fn delete_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        let base = self.admin_url(&format!("/{}/users", slug.realm_name()));
        let ids = self
            .find_ids(
                "find admin user",
                base.clone(),
                &[("email", email.as_str()), ("exact", "true")],
            )
            .await?;
        if ids.is_empty() {
            return Err(BackendError::NotFound(format!("user {email} in realm {slug}")));
        }
        for id in ids {
            let builder = self.request(Method::DELETE, format!("{base}/{id}")).await?;
            self.send("delete admin user", builder).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KeycloakConfig {
        KeycloakConfig {
            base_url: "https://id.example.com/".to_string(),
            admin_realm: "master".to_string(),
            client_id: "admin-cli".to_string(),
            client_secret: "secret".to_string(),
            tenant_clients: vec!["web".to_string()],
            tenant_roles: vec!["tenant_admin".to_string()],
        }
    }

    #[test]
    fn admin_urls_are_rooted_without_double_slashes() {
        let admin = KeycloakAdmin::new(config());
        assert_eq!(admin.admin_url(""), "https://id.example.com/admin/realms");
        assert_eq!(
            admin.admin_url("/acme/clients"),
            "https://id.example.com/admin/realms/acme/clients"
        );
    }

    #[tokio::test]
    async fn unreachable_server_maps_to_unavailable() {
        let mut cfg = config();
        cfg.base_url = "http://127.0.0.1:9".to_string();
        let admin = KeycloakAdmin::new(cfg);
        let slug = TenantSlug::parse("acme").unwrap();

        let err = admin.delete_realm(&slug).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
    }
}
