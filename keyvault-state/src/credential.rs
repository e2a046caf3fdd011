//! Service-principal authentication
//!
//! [`CredentialResolver`] turns a [`BackendConfig`] into a [`Credential`]:
//! it checks that the service principal is fully configured, resolves the
//! cloud environment and exchanges the client secret for one token per
//! audience. Failures are always surfaced; nothing is retried here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::backend::{AuthFailure, BackendError, BackendResult};
use crate::config::BackendConfig;
use crate::environment::{CloudEnvironment, resolve_environment};
use crate::remote::{AccessToken, IdentityProvider, ManagementPlane, TokenRequest};

/// An authenticated service principal
#[derive(Debug, Clone)]
pub struct Credential {
    pub client_id: String,
    pub tenant_id: String,
    pub subscription_id: String,
    pub environment: CloudEnvironment,
    /// Token for resource-manager calls
    pub management: AccessToken,
    /// Token for vault data-plane calls
    pub vault: AccessToken,
}

impl Credential {
    /// Identity shown in logs and errors
    pub fn identity(&self) -> String {
        format!("{}@{}", self.client_id, self.tenant_id)
    }

    /// End of the validity window (the earlier of the two tokens)
    pub fn expires_on(&self) -> DateTime<Utc> {
        self.management.expires_on.min(self.vault.expires_on)
    }
}

/// Resolves credentials against the identity provider
pub struct CredentialResolver {
    identity: Arc<dyn IdentityProvider>,
    management: Arc<dyn ManagementPlane>,
    timeout: Duration,
}

impl CredentialResolver {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        management: Arc<dyn ManagementPlane>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            management,
            timeout,
        }
    }

    pub async fn resolve(&self, config: &BackendConfig) -> BackendResult<Credential> {
        let principal = ServicePrincipal::from_config(config)?;
        let environment =
            resolve_environment(config, self.management.as_ref(), self.timeout).await?;

        debug!(
            "Authenticating {}@{} against {}",
            principal.client_id, principal.tenant_id, environment.name
        );

        let management = self
            .exchange(&principal, &environment, &environment.management_audience)
            .await?;
        let vault = self
            .exchange(&principal, &environment, &environment.key_vault_audience)
            .await?;

        info!(
            "Authenticated {}@{} (tokens valid until {})",
            principal.client_id,
            principal.tenant_id,
            management.expires_on.min(vault.expires_on)
        );

        Ok(Credential {
            client_id: principal.client_id.to_string(),
            tenant_id: principal.tenant_id.to_string(),
            subscription_id: principal.subscription_id.to_string(),
            environment,
            management,
            vault,
        })
    }

    async fn exchange(
        &self,
        principal: &ServicePrincipal<'_>,
        environment: &CloudEnvironment,
        audience: &str,
    ) -> BackendResult<AccessToken> {
        let request = TokenRequest {
            authority: &environment.active_directory_endpoint,
            tenant_id: principal.tenant_id,
            client_id: principal.client_id,
            client_secret: principal.client_secret,
            audience,
        };

        match tokio::time::timeout(self.timeout, self.identity.exchange_token(&request)).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(err)) => Err(BackendError::auth_caused_by(
                AuthFailure::TokenExchangeFailed,
                format!(
                    "Token exchange for {} as {} failed",
                    audience, principal.client_id
                ),
                err,
            )),
            Err(_) => Err(BackendError::auth(
                AuthFailure::TokenExchangeFailed,
                format!(
                    "Token exchange for {} timed out after {:?}",
                    audience, self.timeout
                ),
            )),
        }
    }
}

/// Borrowed, validated credential inputs
struct ServicePrincipal<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    tenant_id: &'a str,
    subscription_id: &'a str,
}

impl<'a> ServicePrincipal<'a> {
    fn from_config(config: &'a BackendConfig) -> BackendResult<Self> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.trim().is_empty())
        }

        let client_id = present(&config.client_id);
        let client_secret = config
            .client_secret
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.expose());
        let tenant_id = present(&config.tenant_id);
        let subscription_id = present(&config.subscription_id);

        match (client_id, client_secret, tenant_id, subscription_id) {
            (Some(client_id), Some(client_secret), Some(tenant_id), Some(subscription_id)) => {
                Ok(Self {
                    client_id,
                    client_secret,
                    tenant_id,
                    subscription_id,
                })
            }
            _ => {
                let missing: Vec<&str> = [
                    ("client_id", client_id.is_none()),
                    ("client_secret", client_secret.is_none()),
                    ("tenant_id", tenant_id.is_none()),
                    ("subscription_id", subscription_id.is_none()),
                ]
                .into_iter()
                .filter(|(_, missing)| *missing)
                .map(|(name, _)| name)
                .collect();

                Err(BackendError::auth(
                    AuthFailure::MissingCredential,
                    format!("Missing service principal fields: {}", missing.join(", ")),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::remote::memory::{Fault, InMemoryVault};

    fn resolver(vault: &Arc<InMemoryVault>) -> CredentialResolver {
        CredentialResolver::new(vault.clone(), vault.clone(), Duration::from_secs(5))
    }

    fn config() -> BackendConfig {
        BackendConfig::new("v1", "tfstate-prod").with_service_principal(
            "client",
            "secret",
            "tenant",
            "subscription",
        )
    }

    #[tokio::test]
    async fn test_resolve_issues_one_token_per_audience() {
        let vault = Arc::new(InMemoryVault::new());
        let credential = resolver(&vault).resolve(&config()).await.unwrap();

        assert_eq!(credential.identity(), "client@tenant");
        assert_eq!(credential.management.audience, "https://management.azure.com/");
        assert_eq!(credential.vault.audience, "https://vault.azure.net");
        assert!(!credential.vault.is_expired());
        assert_eq!(vault.token_exchanges(), 2);
    }

    #[tokio::test]
    async fn test_missing_client_id() {
        let vault = Arc::new(InMemoryVault::new());
        let mut config = config();
        config.client_id = Some(String::new());

        match resolver(&vault).resolve(&config).await {
            Err(BackendError::Auth {
                reason, message, ..
            }) => {
                assert_eq!(reason, AuthFailure::MissingCredential);
                assert_eq!(message, "Missing service principal fields: client_id");
            }
            other => panic!("Expected Auth error, got {:?}", other),
        }
        assert_eq!(vault.token_exchanges(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields_are_all_named() {
        let vault = Arc::new(InMemoryVault::new());
        let config = BackendConfig::new("v1", "state");

        let error = resolver(&vault).resolve(&config).await.unwrap_err();
        let message = error.to_string();
        for field in ["client_id", "client_secret", "tenant_id", "subscription_id"] {
            assert!(message.contains(field), "{} not in {}", field, message);
        }
    }

    #[tokio::test]
    async fn test_rejected_token_exchange() {
        let vault = Arc::new(InMemoryVault::new());
        vault.inject(Fault::TokenExchange(RemoteError::Unauthorized(
            "AADSTS7000215: Invalid client secret".to_string(),
        )));

        match resolver(&vault).resolve(&config()).await {
            Err(BackendError::Auth { reason, source, .. }) => {
                assert_eq!(reason, AuthFailure::TokenExchangeFailed);
                assert!(matches!(source, Some(RemoteError::Unauthorized(_))));
            }
            other => panic!("Expected Auth error, got {:?}", other),
        }
    }
}
