//! Authorized session against one vault

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::backend::{AuthFailure, BackendError, BackendResult};
use crate::credential::Credential;
use crate::environment::CloudEnvironment;
use crate::remote::{RemoteError, RemoteServices, VaultDataPlane, VaultEndpoint, VaultLookup};
use crate::state::StatePath;

/// A credential bound to a vault that is known to exist
///
/// Opened once per backend configuration and shared by the secret store and
/// the lock coordinator. Nothing in it changes after [`VaultSession::open`].
pub struct VaultSession {
    vault_name: String,
    resource_group: Option<String>,
    credential: Credential,
    endpoint: VaultEndpoint,
    data_plane: Arc<dyn VaultDataPlane>,
}

impl VaultSession {
    /// Check that the vault exists and record its data-plane address
    ///
    /// Performs exactly one management-plane lookup.
    pub async fn open(
        credential: Credential,
        services: &RemoteServices,
        vault_name: &str,
        resource_group: Option<&str>,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let scope = match resource_group {
            Some(group) => format!("resource group {}", group),
            None => format!("subscription {}", credential.subscription_id),
        };
        debug!("Looking up key vault {} in {}", vault_name, scope);

        let lookup = VaultLookup {
            resource_manager: &credential.environment.resource_manager_endpoint,
            subscription_id: &credential.subscription_id,
            resource_group,
            vault_name,
        };
        let result = tokio::time::timeout(
            timeout,
            services.management.get_vault(&credential.management, &lookup),
        )
        .await;

        let descriptor = match result {
            Ok(Ok(Some(descriptor))) => descriptor,
            Ok(Ok(None)) | Ok(Err(RemoteError::NotFound(_))) => {
                return Err(BackendError::VaultNotFound {
                    vault: vault_name.to_string(),
                    scope,
                });
            }
            Ok(Err(err @ RemoteError::Unauthorized(_))) => {
                return Err(BackendError::auth_caused_by(
                    AuthFailure::TokenExchangeFailed,
                    format!("{} may not read key vault {}", credential.identity(), vault_name),
                    err,
                ));
            }
            Ok(Err(err)) => return Err(BackendError::transient("look up vault", vault_name, err)),
            Err(_) => return Err(BackendError::timeout("look up vault", vault_name, timeout)),
        };

        let uri = descriptor
            .vault_uri
            .filter(|uri| !uri.is_empty())
            .unwrap_or_else(|| credential.environment.vault_uri(vault_name));
        info!("Key vault {} found at {}", descriptor.name, uri);

        let endpoint = VaultEndpoint {
            uri,
            token: credential.vault.clone(),
        };

        Ok(Self {
            vault_name: vault_name.to_string(),
            resource_group: resource_group.map(str::to_string),
            credential,
            endpoint,
            data_plane: services.data_plane.clone(),
        })
    }

    pub fn vault_name(&self) -> &str {
        &self.vault_name
    }

    pub fn resource_group(&self) -> Option<&str> {
        self.resource_group.as_deref()
    }

    pub fn vault_uri(&self) -> &str {
        &self.endpoint.uri
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn environment(&self) -> &CloudEnvironment {
        &self.credential.environment
    }

    pub fn endpoint(&self) -> &VaultEndpoint {
        &self.endpoint
    }

    pub fn data_plane(&self) -> &Arc<dyn VaultDataPlane> {
        &self.data_plane
    }

    /// Path of a secret in this vault
    pub fn path(&self, secret_name: &str) -> StatePath {
        StatePath::new(&self.vault_name, secret_name)
    }

    /// Reject paths that point at another vault
    pub(crate) fn check_path(&self, path: &StatePath) -> BackendResult<()> {
        if path.vault != self.vault_name {
            return Err(BackendError::configuration(format!(
                "Path {} is outside vault {}",
                path, self.vault_name
            )));
        }
        Ok(())
    }
}
