//! In-memory platform implementing every backend capability (tests/dev).
//!
//! Mirrors the behaviour the steps rely on from the real backends:
//! - deleting a realm cascades to its clients, roles and users
//! - deletes of missing resources report `NotFound`
//! - creates of existing resources report `AlreadyExists`
//!
//! Every call is appended to a journal (`"<operation>:<slug>"`) before any
//! injected fault is applied, so tests can assert on exactly what was tried.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use tenantforge_core::{AdminEmail, TenantName, TenantSlug};

use super::{
    BackendError, IdentityProvider, InvitationService, ObjectStorage, Revocation, SchemaManager,
    UserDirectory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Pending,
    Accepted,
    Revoked,
}

#[derive(Debug, Default)]
struct Realm {
    display_name: String,
    clients: BTreeSet<String>,
    roles: BTreeSet<String>,
    refresh_rotation: bool,
    users: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PlatformState {
    schemas: BTreeSet<String>,
    realms: BTreeMap<String, Realm>,
    buckets: BTreeSet<String>,
    invitations: BTreeMap<(String, String), InvitationState>,
    faults: HashMap<&'static str, BackendError>,
    journal: Vec<String>,
}

/// All five backends in one process-local value.
#[derive(Debug)]
pub struct InMemoryPlatform {
    state: Mutex<PlatformState>,
    client_ids: Vec<String>,
    roles: Vec<String>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState::default()),
            client_ids: vec!["web".to_string(), "api".to_string()],
            roles: vec!["tenant_admin".to_string(), "tenant_member".to_string()],
        }
    }

    /// Make every subsequent call to `operation` fail with `error`.
    pub fn fail(&self, operation: &'static str, error: BackendError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(operation, error);
        }
    }

    pub fn clear_fault(&self, operation: &'static str) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.remove(operation);
        }
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.journal.clone())
            .unwrap_or_default()
    }

    pub fn has_schema(&self, slug: &TenantSlug) -> bool {
        self.read(|s| s.schemas.contains(&slug.schema_name()))
    }

    pub fn has_realm(&self, slug: &TenantSlug) -> bool {
        self.read(|s| s.realms.contains_key(slug.realm_name()))
    }

    pub fn realm_display_name(&self, slug: &TenantSlug) -> Option<String> {
        self.state
            .lock()
            .ok()?
            .realms
            .get(slug.realm_name())
            .map(|r| r.display_name.clone())
    }

    pub fn clients(&self, slug: &TenantSlug) -> Vec<String> {
        self.realm_view(slug, |r| r.clients.iter().cloned().collect())
    }

    pub fn roles(&self, slug: &TenantSlug) -> Vec<String> {
        self.realm_view(slug, |r| r.roles.iter().cloned().collect())
    }

    pub fn refresh_rotation_enabled(&self, slug: &TenantSlug) -> bool {
        self.realm_view(slug, |r| r.refresh_rotation)
    }

    pub fn has_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> bool {
        self.realm_view(slug, |r| r.users.contains(email.as_str()))
    }

    pub fn has_bucket(&self, slug: &TenantSlug) -> bool {
        self.read(|s| s.buckets.contains(&slug.bucket_name()))
    }

    pub fn invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Option<InvitationState> {
        self.state
            .lock()
            .ok()?
            .invitations
            .get(&invitation_key(slug, email))
            .copied()
    }

    /// Simulate the invitee accepting.
    pub fn accept_invitation(&self, slug: &TenantSlug, email: &AdminEmail) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(inv) = state.invitations.get_mut(&invitation_key(slug, email)) {
                *inv = InvitationState::Accepted;
            }
        }
    }

    /// Remove a schema behind the platform's back (e.g. an operator cleanup).
    pub fn remove_schema_out_of_band(&self, slug: &TenantSlug) {
        if let Ok(mut state) = self.state.lock() {
            state.schemas.remove(&slug.schema_name());
        }
    }

    /// No resource of any kind exists for `slug`.
    pub fn is_clean(&self, slug: &TenantSlug) -> bool {
        self.read(|s| {
            !s.schemas.contains(&slug.schema_name())
                && !s.realms.contains_key(slug.realm_name())
                && !s.buckets.contains(&slug.bucket_name())
                && !s
                    .invitations
                    .iter()
                    .any(|((t, _), st)| t == slug.as_str() && *st == InvitationState::Pending)
        })
    }

    fn read(&self, f: impl FnOnce(&PlatformState) -> bool) -> bool {
        self.state.lock().map(|s| f(&s)).unwrap_or(false)
    }

    fn realm_view<T: Default>(&self, slug: &TenantSlug, f: impl FnOnce(&Realm) -> T) -> T {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.realms.get(slug.realm_name()).map(f))
            .unwrap_or_default()
    }

    /// Journal the call, then apply any injected fault.
    fn begin(&self, operation: &'static str, slug: &TenantSlug) -> Result<MutexGuard<'_, PlatformState>, BackendError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BackendError::Unavailable("in-memory platform state poisoned".to_string()))?;
        state.journal.push(format!("{operation}:{slug}"));
        if let Some(err) = state.faults.get(operation) {
            return Err(err.clone());
        }
        Ok(state)
    }
}

fn invitation_key(slug: &TenantSlug, email: &AdminEmail) -> (String, String) {
    (slug.as_str().to_string(), email.as_str().to_string())
}

fn realm_mut<'a>(state: &'a mut PlatformState, slug: &TenantSlug) -> Result<&'a mut Realm, BackendError> {
    state
        .realms
        .get_mut(slug.realm_name())
        .ok_or_else(|| BackendError::NotFound(format!("realm {slug}")))
}

#[async_trait]
impl SchemaManager for InMemoryPlatform {
    async fn create_schema(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("create_schema", slug)?;
        let schema = slug.schema_name();
        if !state.schemas.insert(schema.clone()) {
            return Err(BackendError::AlreadyExists(format!("schema {schema}")));
        }
        Ok(())
    }

    async fn drop_schema(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("drop_schema", slug)?;
        let schema = slug.schema_name();
        if !state.schemas.remove(&schema) {
            return Err(BackendError::NotFound(format!("schema {schema}")));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryPlatform {
    async fn create_realm(&self, slug: &TenantSlug, name: &TenantName) -> Result<(), BackendError> {
        let mut state = self.begin("create_realm", slug)?;
        if state.realms.contains_key(slug.realm_name()) {
            return Err(BackendError::AlreadyExists(format!("realm {slug}")));
        }
        state.realms.insert(
            slug.realm_name().to_string(),
            Realm {
                display_name: name.as_str().to_string(),
                ..Realm::default()
            },
        );
        Ok(())
    }

    async fn delete_realm(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("delete_realm", slug)?;
        state
            .realms
            .remove(slug.realm_name())
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("realm {slug}")))
    }

    async fn create_clients(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("create_clients", slug)?;
        let realm = realm_mut(&mut state, slug)?;
        for client in &self.client_ids {
            if !realm.clients.insert(client.clone()) {
                return Err(BackendError::AlreadyExists(format!("client {client} in realm {slug}")));
            }
        }
        Ok(())
    }

    async fn delete_clients(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("delete_clients", slug)?;
        let realm = realm_mut(&mut state, slug)?;
        if realm.clients.is_empty() {
            return Err(BackendError::NotFound(format!("clients in realm {slug}")));
        }
        for client in &self.client_ids {
            realm.clients.remove(client);
        }
        Ok(())
    }

    async fn provision_roles(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("provision_roles", slug)?;
        let realm = realm_mut(&mut state, slug)?;
        realm.roles.extend(self.roles.iter().cloned());
        Ok(())
    }

    async fn configure_refresh_rotation(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("configure_refresh_rotation", slug)?;
        realm_mut(&mut state, slug)?.refresh_rotation = true;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for InMemoryPlatform {
    async fn create_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("create_bucket", slug)?;
        let bucket = slug.bucket_name();
        if !state.buckets.insert(bucket.clone()) {
            return Err(BackendError::AlreadyExists(format!("bucket {bucket}")));
        }
        Ok(())
    }

    async fn delete_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let mut state = self.begin("delete_bucket", slug)?;
        let bucket = slug.bucket_name();
        if !state.buckets.remove(&bucket) {
            return Err(BackendError::NotFound(format!("bucket {bucket}")));
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemoryPlatform {
    async fn create_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        let mut state = self.begin("create_admin_user", slug)?;
        let realm = realm_mut(&mut state, slug)?;
        if !realm.users.insert(email.as_str().to_string()) {
            return Err(BackendError::AlreadyExists(format!("user {email} in realm {slug}")));
        }
        Ok(())
    }

    async fn delete_admin_user(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        let mut state = self.begin("delete_admin_user", slug)?;
        let realm = realm_mut(&mut state, slug)?;
        if !realm.users.remove(email.as_str()) {
            return Err(BackendError::NotFound(format!("user {email} in realm {slug}")));
        }
        Ok(())
    }
}

#[async_trait]
impl InvitationService for InMemoryPlatform {
    async fn send_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<(), BackendError> {
        let mut state = self.begin("send_invitation", slug)?;
        state
            .invitations
            .insert(invitation_key(slug, email), InvitationState::Pending);
        Ok(())
    }

    async fn revoke_invitation(&self, slug: &TenantSlug, email: &AdminEmail) -> Result<Revocation, BackendError> {
        let mut state = self.begin("revoke_invitation", slug)?;
        match state.invitations.get_mut(&invitation_key(slug, email)) {
            None => Err(BackendError::NotFound(format!("invitation for {email} in {slug}"))),
            Some(InvitationState::Accepted) => Ok(Revocation::AlreadyAccepted),
            Some(inv) => {
                *inv = InvitationState::Revoked;
                Ok(Revocation::Revoked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug() -> TenantSlug {
        TenantSlug::parse("acme").unwrap()
    }

    #[tokio::test]
    async fn realm_deletion_cascades() {
        let platform = InMemoryPlatform::new();
        let name = TenantName::parse("Acme").unwrap();
        let email = AdminEmail::parse("ops@acme.example").unwrap();

        platform.create_realm(&slug(), &name).await.unwrap();
        platform.create_clients(&slug()).await.unwrap();
        platform.provision_roles(&slug()).await.unwrap();
        platform.create_admin_user(&slug(), &email).await.unwrap();
        assert_eq!(platform.clients(&slug()), vec!["api", "web"]);

        platform.delete_realm(&slug()).await.unwrap();

        assert!(platform.clients(&slug()).is_empty());
        assert!(platform.roles(&slug()).is_empty());
        assert!(!platform.has_admin_user(&slug(), &email));
        assert!(matches!(
            platform.delete_clients(&slug()).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn faults_are_journaled_and_sticky() {
        let platform = InMemoryPlatform::new();
        platform.fail("create_bucket", BackendError::Unavailable("s3 down".into()));

        assert!(platform.create_bucket(&slug()).await.is_err());
        assert!(platform.create_bucket(&slug()).await.is_err());
        platform.clear_fault("create_bucket");
        platform.create_bucket(&slug()).await.unwrap();

        assert_eq!(
            platform.calls(),
            vec!["create_bucket:acme", "create_bucket:acme", "create_bucket:acme"]
        );
        assert!(platform.has_bucket(&slug()));
    }

    #[tokio::test]
    async fn accepted_invitations_cannot_be_revoked() {
        let platform = InMemoryPlatform::new();
        let email = AdminEmail::parse("ops@acme.example").unwrap();

        platform.send_invitation(&slug(), &email).await.unwrap();
        platform.accept_invitation(&slug(), &email);

        assert_eq!(
            platform.revoke_invitation(&slug(), &email).await,
            Ok(Revocation::AlreadyAccepted)
        );
        assert_eq!(platform.invitation(&slug(), &email), Some(InvitationState::Accepted));
    }
}
