//! In-process vault
//!
//! Implements the identity provider, the management plane and the data
//! plane against shared in-memory tables. Leases are enforced the same way
//! the remote service enforces them, so lock logic can be exercised without a
//! network. One-shot [`Fault`]s make individual calls fail.
//!
//! Secret versions are numbered from `"1"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use url::Url;

use super::{
    AccessToken, IdentityProvider, LeaseToken, ManagementPlane, Metadata, RemoteError,
    RemoteResult, TokenRequest, VaultDataPlane, VaultDescriptor, VaultEndpoint, VaultLookup,
};
use crate::environment::CloudEnvironment;

/// A failure to inject into the next matching call
#[derive(Debug, Clone)]
pub enum Fault {
    TokenExchange(RemoteError),
    GetVault(RemoteError),
    GetSecret(RemoteError),
    SetSecret(RemoteError),
    GetMetadata(RemoteError),
    SetMetadata(RemoteError),
    /// Apply the metadata write, then hang before answering
    StallAfterSetMetadata(Duration),
    AcquireLease(RemoteError),
    /// Grant the lease, then report the error to the caller
    AcquireLeaseAfterGrant(RemoteError),
    ReleaseLease(RemoteError),
}

struct Lease {
    token: LeaseToken,
    expires: Instant,
}

#[derive(Default)]
struct Tables {
    /// Vault name -> resource group
    vaults: HashMap<String, String>,
    /// Secret name -> versions, oldest first
    secrets: HashMap<String, Vec<Vec<u8>>>,
    metadata: HashMap<String, Metadata>,
    leases: HashMap<String, Lease>,
}

impl Tables {
    fn live_lease(&self, name: &str) -> Option<&LeaseToken> {
        self.leases
            .get(name)
            .filter(|lease| lease.expires > Instant::now())
            .map(|lease| &lease.token)
    }

    /// A write must carry the live lease, and only the live lease
    fn check_lease(&self, name: &str, supplied: Option<&LeaseToken>) -> RemoteResult<()> {
        match (self.live_lease(name), supplied) {
            (None, None) => Ok(()),
            (Some(live), Some(supplied)) if live == supplied => Ok(()),
            (Some(_), None) => Err(RemoteError::LeaseMismatch(format!(
                "{} is leased and no lease id was supplied",
                name
            ))),
            (Some(_), Some(_)) => Err(RemoteError::LeaseMismatch(format!(
                "{} is leased under a different id",
                name
            ))),
            (None, Some(_)) => Err(RemoteError::LeaseMismatch(format!(
                "{} has no live lease",
                name
            ))),
        }
    }
}

/// In-memory implementation of every remote capability
#[derive(Default)]
pub struct InMemoryVault {
    tables: Mutex<Tables>,
    faults: Mutex<Vec<Fault>>,
    interleave: AtomicBool,
    token_exchanges: AtomicUsize,
    vault_lookups: AtomicUsize,
    environment_lookups: AtomicUsize,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vault for management-plane lookups
    pub fn create_vault(&self, name: &str, resource_group: &str) {
        self.tables()
            .vaults
            .insert(name.to_string(), resource_group.to_string());
    }

    /// Queue a one-shot fault
    pub fn inject(&self, fault: Fault) {
        lock_ignoring_poison(&self.faults).push(fault);
    }

    /// Yield to the scheduler at the start of every data-plane call
    pub fn interleave_calls(&self, enabled: bool) {
        self.interleave.store(enabled, Ordering::SeqCst);
    }

    pub fn token_exchanges(&self) -> usize {
        self.token_exchanges.load(Ordering::SeqCst)
    }

    pub fn vault_lookups(&self) -> usize {
        self.vault_lookups.load(Ordering::SeqCst)
    }

    pub fn environment_lookups(&self) -> usize {
        self.environment_lookups.load(Ordering::SeqCst)
    }

    pub fn secret_versions(&self, name: &str) -> usize {
        self.tables().secrets.get(name).map_or(0, Vec::len)
    }

    pub fn metadata(&self, name: &str) -> Metadata {
        self.tables().metadata.get(name).cloned().unwrap_or_default()
    }

    /// The live lease on a secret, if any
    pub fn lease(&self, name: &str) -> Option<LeaseToken> {
        self.tables().live_lease(name).cloned()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock_ignoring_poison(&self.tables)
    }

    fn take_fault<T>(&self, select: impl Fn(&Fault) -> Option<T>) -> Option<T> {
        let mut faults = lock_ignoring_poison(&self.faults);
        let position = faults.iter().position(|f| select(f).is_some())?;
        select(&faults.remove(position))
    }

    fn fail_if(&self, select: impl Fn(&Fault) -> Option<RemoteError>) -> RemoteResult<()> {
        match self.take_fault(select) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        if self.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl IdentityProvider for InMemoryVault {
    async fn exchange_token(&self, request: &TokenRequest<'_>) -> RemoteResult<AccessToken> {
        self.token_exchanges.fetch_add(1, Ordering::SeqCst);
        self.fail_if(|f| match f {
            Fault::TokenExchange(err) => Some(err.clone()),
            _ => None,
        })?;

        if request.client_secret.is_empty() {
            return Err(RemoteError::Unauthorized("empty client secret".to_string()));
        }

        Ok(AccessToken {
            token: format!("token-{}-{}", request.client_id, request.audience),
            expires_on: Utc::now() + TimeDelta::hours(1),
            audience: request.audience.to_string(),
        })
    }
}

#[async_trait]
impl ManagementPlane for InMemoryVault {
    async fn environment_metadata(&self, endpoint: &Url) -> RemoteResult<CloudEnvironment> {
        self.environment_lookups.fetch_add(1, Ordering::SeqCst);
        let mut environment = CloudEnvironment::public();
        environment.name = "custom".to_string();
        environment.resource_manager_endpoint = endpoint.to_string();
        environment.management_audience = endpoint.to_string();
        Ok(environment)
    }

    async fn get_vault(
        &self,
        _token: &AccessToken,
        lookup: &VaultLookup<'_>,
    ) -> RemoteResult<Option<VaultDescriptor>> {
        self.vault_lookups.fetch_add(1, Ordering::SeqCst);
        self.fail_if(|f| match f {
            Fault::GetVault(err) => Some(err.clone()),
            _ => None,
        })?;

        let tables = self.tables();
        let found = tables
            .vaults
            .get(lookup.vault_name)
            .is_some_and(|group| lookup.resource_group.is_none_or(|wanted| wanted == group.as_str()));

        Ok(found.then(|| VaultDescriptor {
            name: lookup.vault_name.to_string(),
            vault_uri: None,
        }))
    }
}

#[async_trait]
impl VaultDataPlane for InMemoryVault {
    async fn get_secret(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        version: Option<&str>,
    ) -> RemoteResult<Option<Vec<u8>>> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::GetSecret(err) => Some(err.clone()),
            _ => None,
        })?;

        let tables = self.tables();
        let Some(versions) = tables.secrets.get(name) else {
            return Ok(None);
        };
        let value = match version {
            Some(version) => {
                let index = version
                    .parse::<usize>()
                    .ok()
                    .and_then(|v| v.checked_sub(1))
                    .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", name, version)))?;
                versions.get(index).cloned()
            }
            None => versions.last().cloned(),
        };
        Ok(value)
    }

    async fn set_secret(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        value: &[u8],
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::SetSecret(err) => Some(err.clone()),
            _ => None,
        })?;

        let mut tables = self.tables();
        tables.check_lease(name, lease)?;
        tables
            .secrets
            .entry(name.to_string())
            .or_default()
            .push(value.to_vec());
        Ok(())
    }

    async fn delete_secret(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()> {
        self.pause().await;
        let mut tables = self.tables();
        tables.check_lease(name, lease)?;
        match tables.secrets.remove(name) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(name.to_string())),
        }
    }

    async fn get_metadata(&self, _vault: &VaultEndpoint, name: &str) -> RemoteResult<Metadata> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::GetMetadata(err) => Some(err.clone()),
            _ => None,
        })?;

        Ok(self.metadata(name))
    }

    async fn set_metadata(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        metadata: &Metadata,
        lease: &LeaseToken,
    ) -> RemoteResult<()> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::SetMetadata(err) => Some(err.clone()),
            _ => None,
        })?;

        {
            let mut tables = self.tables();
            tables.check_lease(name, Some(lease))?;
            tables.metadata.insert(name.to_string(), metadata.clone());
        }

        let stall = self.take_fault(|f| match f {
            Fault::StallAfterSetMetadata(duration) => Some(*duration),
            _ => None,
        });
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        proposed: &LeaseToken,
        duration: Duration,
    ) -> RemoteResult<LeaseToken> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::AcquireLease(err) => Some(err.clone()),
            _ => None,
        })?;

        {
            let mut tables = self.tables();
            if tables.live_lease(name).is_some_and(|live| live != proposed) {
                return Err(RemoteError::LeaseConflict(name.to_string()));
            }
            tables.leases.insert(
                name.to_string(),
                Lease {
                    token: proposed.clone(),
                    expires: Instant::now() + duration,
                },
            );
        }

        self.fail_if(|f| match f {
            Fault::AcquireLeaseAfterGrant(err) => Some(err.clone()),
            _ => None,
        })?;
        Ok(proposed.clone())
    }

    async fn release_lease(
        &self,
        _vault: &VaultEndpoint,
        name: &str,
        lease: &LeaseToken,
    ) -> RemoteResult<()> {
        self.pause().await;
        self.fail_if(|f| match f {
            Fault::ReleaseLease(err) => Some(err.clone()),
            _ => None,
        })?;

        let mut tables = self.tables();
        tables.check_lease(name, Some(lease))?;
        tables.leases.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> VaultEndpoint {
        VaultEndpoint {
            uri: "https://v1.vault.azure.net/".to_string(),
            token: AccessToken {
                token: "t".to_string(),
                expires_on: Utc::now() + TimeDelta::hours(1),
                audience: "https://vault.azure.net".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_lease_guards_writes() {
        let vault = InMemoryVault::new();
        let ep = endpoint();
        let lease = LeaseToken::new("a");
        let other = LeaseToken::new("b");

        vault
            .acquire_lease(&ep, "state", &lease, Duration::from_secs(60))
            .await
            .unwrap();

        let conflict = vault
            .acquire_lease(&ep, "state", &other, Duration::from_secs(60))
            .await;
        assert!(matches!(conflict, Err(RemoteError::LeaseConflict(_))));

        let unleased = vault.set_secret(&ep, "state", b"x", None).await;
        assert!(matches!(unleased, Err(RemoteError::LeaseMismatch(_))));
        vault.set_secret(&ep, "state", b"x", Some(&lease)).await.unwrap();

        let wrong = vault.set_metadata(&ep, "state", &Metadata::new(), &other).await;
        assert!(matches!(wrong, Err(RemoteError::LeaseMismatch(_))));

        vault.release_lease(&ep, "state", &lease).await.unwrap();
        assert!(vault.lease("state").is_none());
        vault.set_secret(&ep, "state", b"y", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_not_live() {
        let vault = InMemoryVault::new();
        let ep = endpoint();

        vault
            .acquire_lease(&ep, "state", &LeaseToken::new("a"), Duration::ZERO)
            .await
            .unwrap();
        assert!(vault.lease("state").is_none());

        vault
            .acquire_lease(&ep, "state", &LeaseToken::new("b"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(vault.lease("state"), Some(LeaseToken::new("b")));
    }

    #[tokio::test]
    async fn test_faults_are_one_shot() {
        let vault = InMemoryVault::new();
        let ep = endpoint();
        vault.inject(Fault::GetSecret(RemoteError::Transport("reset".to_string())));

        assert!(vault.get_secret(&ep, "state", None).await.is_err());
        assert!(vault.get_secret(&ep, "state", None).await.unwrap().is_none());
    }
}
