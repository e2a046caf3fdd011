//! Remote state client: the public face of the backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::config::{BackendConfig, RawBackendConfig};
use crate::coordinator::LockCoordinator;
use crate::credential::CredentialResolver;
use crate::lock::{LockDescriptor, LockInfo};
use crate::remote::{LeaseToken, RemoteServices};
use crate::secret_store::SecretStore;
use crate::session::VaultSession;
use crate::state::{StatePath, StatePayload};

/// State stored in one Key Vault secret, guarded by a lease-based lock
pub struct RemoteStateClient {
    path: StatePath,
    store: SecretStore,
    locks: LockCoordinator,
    /// Lease of the lock this client acquired, attached to writes
    held_lease: RwLock<Option<LeaseToken>>,
}

impl RemoteStateClient {
    /// Authenticate, open the vault and build a client for the configured secret
    pub async fn configure(config: &BackendConfig, services: RemoteServices) -> BackendResult<Self> {
        let resolver = CredentialResolver::new(
            services.identity.clone(),
            services.management.clone(),
            config.management_timeout,
        );
        let credential = resolver.resolve(config).await?;

        let session = VaultSession::open(
            credential,
            &services,
            &config.vault_name,
            config.resource_group_name.as_deref(),
            config.management_timeout,
        )
        .await?;

        Ok(Self::new(
            Arc::new(session),
            &config.secret_name,
            config.lease_duration,
            config.lock_timeout,
        ))
    }

    pub fn new(
        session: Arc<VaultSession>,
        secret_name: &str,
        lease_duration: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            path: session.path(secret_name),
            store: SecretStore::new(session.clone()),
            locks: LockCoordinator::new(session, lease_duration, lock_timeout),
            held_lease: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &StatePath {
        &self.path
    }

    /// Who holds the lock right now, if anyone
    pub async fn current_lock(&self) -> BackendResult<Option<LockInfo>> {
        self.locks.current_lock(&self.path).await
    }
}

#[async_trait]
impl StateBackend for RemoteStateClient {
    async fn get(&self) -> BackendResult<Option<StatePayload>> {
        self.store.get(&self.path).await
    }

    async fn put(&self, payload: &StatePayload) -> BackendResult<()> {
        let lease = self.held_lease.read().await.clone();
        self.store.put(&self.path, payload, lease.as_ref()).await
    }

    async fn delete(&self) -> BackendResult<()> {
        let lease = self.held_lease.read().await.clone();
        self.store.delete(&self.path, lease.as_ref()).await
    }

    async fn lock(&self, descriptor: &LockDescriptor) -> BackendResult<String> {
        let lock = self.locks.lock(&self.path, descriptor).await?;
        *self.held_lease.write().await = Some(LeaseToken::new(&lock.id));
        Ok(lock.id)
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.locks.unlock(&self.path, lock_id).await?;

        let mut held = self.held_lease.write().await;
        if held.as_ref().is_some_and(|lease| lease.as_str() == lock_id) {
            *held = None;
        }
        Ok(())
    }
}

/// Create a backend from raw configuration, talking to Azure
pub async fn create_backend(raw: &RawBackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    let config = raw.resolve()?;
    debug!(
        "Configuring key vault backend for {}/{}",
        config.vault_name, config.secret_name
    );

    let services = RemoteServices::azure(config.management_timeout).map_err(|e| {
        BackendError::configuration(format!("Failed to build HTTP client: {}", e))
    })?;
    let client = RemoteStateClient::configure(&config, services).await?;
    Ok(Box::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthFailure;
    use crate::remote::RemoteError;
    use crate::remote::memory::{Fault, InMemoryVault};

    fn config() -> BackendConfig {
        BackendConfig::new("v1", "tfstate-prod")
            .with_service_principal("client", "secret", "tenant", "subscription")
            .with_resource_group("rg")
    }

    async fn client(vault: &Arc<InMemoryVault>) -> RemoteStateClient {
        vault.create_vault("v1", "rg");
        RemoteStateClient::configure(&config(), RemoteServices::from_shared(vault.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_get_is_empty() {
        let _ = env_logger::builder().is_test(true).try_init();
        let vault = Arc::new(InMemoryVault::new());
        let client = client(&vault).await;

        assert!(client.get().await.unwrap().is_none());
        assert_eq!(vault.token_exchanges(), 2);
        assert_eq!(vault.vault_lookups(), 1);
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let vault = Arc::new(InMemoryVault::new());
        let client = client(&vault).await;
        let payload = StatePayload::from(r#"{"version":4,"serial":7}"#);

        client.put(&payload).await.unwrap();
        assert_eq!(client.get().await.unwrap(), Some(payload));

        client.delete().await.unwrap();
        assert!(client.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_client_id_fails_before_any_call() {
        let vault = Arc::new(InMemoryVault::new());
        let raw = RawBackendConfig {
            keyvault_name: Some("v1".to_string()),
            keyvault_prefix: Some("tfstate/prod".to_string()),
            client_id: Some(String::new()),
            client_secret: Some("secret".to_string()),
            tenant_id: Some("tenant".to_string()),
            subscription_id: Some("subscription".to_string()),
            ..Default::default()
        };
        let config = raw.resolve_with(|_| None).unwrap();

        let result =
            RemoteStateClient::configure(&config, RemoteServices::from_shared(vault.clone())).await;
        match result {
            Err(BackendError::Auth { reason, .. }) => {
                assert_eq!(reason, AuthFailure::MissingCredential)
            }
            Err(other) => panic!("Expected Auth error, got {:?}", other),
            Ok(_) => panic!("Expected Auth error"),
        }
        assert_eq!(vault.token_exchanges(), 0);
        assert_eq!(vault.vault_lookups(), 0);
    }

    #[tokio::test]
    async fn test_lock_handoff_between_holders() {
        let vault = Arc::new(InMemoryVault::new());
        let a = client(&vault).await;
        let b = client(&vault).await;

        let l1 = a.lock(&LockDescriptor::new("apply").with_who("A")).await.unwrap();

        match b.lock(&LockDescriptor::new("apply").with_who("B")).await {
            Err(BackendError::Locked { who, lock_id, .. }) => {
                assert_eq!(who, "A");
                assert_eq!(lock_id, l1);
            }
            other => panic!("Expected Locked error, got {:?}", other),
        }

        a.unlock(&l1).await.unwrap();

        let l2 = b.lock(&LockDescriptor::new("apply").with_who("B")).await.unwrap();
        assert_ne!(l1, l2);
        assert_eq!(b.current_lock().await.unwrap().unwrap().who, "B");
    }

    #[tokio::test]
    async fn test_writes_carry_the_held_lease() {
        let vault = Arc::new(InMemoryVault::new());
        let owner = client(&vault).await;
        let intruder = client(&vault).await;

        let lock_id = owner.lock(&LockDescriptor::new("apply")).await.unwrap();
        owner.put(&StatePayload::from("mine")).await.unwrap();

        let error = intruder.put(&StatePayload::from("theirs")).await.unwrap_err();
        assert!(matches!(
            error,
            BackendError::Write {
                source: RemoteError::LeaseMismatch(_),
                ..
            }
        ));
        assert!(intruder.delete().await.is_err());

        owner.unlock(&lock_id).await.unwrap();
        assert_eq!(
            intruder.get().await.unwrap(),
            Some(StatePayload::from("mine"))
        );
        intruder.put(&StatePayload::from("theirs")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_errors_are_structured() {
        let vault = Arc::new(InMemoryVault::new());
        let client = client(&vault).await;

        let error = client.unlock("missing").await.unwrap_err();
        assert!(matches!(error, BackendError::LockNotFound(_)));

        let lock_id = client.lock(&LockDescriptor::new("plan")).await.unwrap();
        let error = client.unlock("other").await.unwrap_err();
        assert!(matches!(error, BackendError::LockMismatch { .. }));

        client.unlock(&lock_id).await.unwrap();
        let error = client.unlock(&lock_id).await.unwrap_err();
        assert!(matches!(error, BackendError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_lets_next_holder_in() {
        let vault = Arc::new(InMemoryVault::new());
        let a = client(&vault).await;
        let b = client(&vault).await;
        vault.inject(Fault::SetMetadata(RemoteError::Transport(
            "connection reset".to_string(),
        )));

        assert!(a.lock(&LockDescriptor::new("apply").with_who("A")).await.is_err());
        b.lock(&LockDescriptor::new("apply").with_who("B")).await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_as_trait_object() {
        let vault = Arc::new(InMemoryVault::new());
        let backend: Box<dyn StateBackend> = Box::new(client(&vault).await);

        let lock_id = backend.lock(&LockDescriptor::new("apply")).await.unwrap();
        backend.put(&StatePayload::from("state")).await.unwrap();
        backend.unlock(&lock_id).await.unwrap();
        assert!(backend.get().await.unwrap().is_some());
    }
}
