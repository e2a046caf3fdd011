//! Remote service boundary
//!
//! Everything this crate needs from the cloud goes through three narrow
//! traits: the identity provider that exchanges a service principal for
//! tokens, the management plane that locates a vault, and the vault data
//! plane that stores secrets, metadata and leases.
//!
//! [`azure::AzureRestClient`] implements all three over HTTPS.
//! [`memory::InMemoryVault`] implements them in process.

pub mod azure;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use crate::environment::CloudEnvironment;

/// Metadata attached to a protected secret
pub type Metadata = HashMap<String, String>;

/// Errors reported by a remote service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The addressed object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Another holder owns a live lease on the object
    #[error("lease already held on {0}")]
    LeaseConflict(String),

    /// The supplied lease token is not the live lease (or none is live)
    #[error("lease token rejected for {0}")]
    LeaseMismatch(String),

    /// The service refused the caller's identity
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other unsuccessful response
    #[error("service returned {status}: {message}")]
    Service { status: u16, message: String },

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// A response body could not be decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Result type for remote calls
pub type RemoteResult<T> = Result<T, RemoteError>;

/// A bearer token for one audience
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
    pub audience: String,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_on
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"***")
            .field("expires_on", &self.expires_on)
            .field("audience", &self.audience)
            .finish()
    }
}

/// Client-credentials token request
pub struct TokenRequest<'a> {
    /// Active Directory authority, e.g. `https://login.microsoftonline.com/`
    pub authority: &'a str,
    pub tenant_id: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub audience: &'a str,
}

/// Arguments of a vault lookup on the management plane
pub struct VaultLookup<'a> {
    pub resource_manager: &'a str,
    pub subscription_id: &'a str,
    pub resource_group: Option<&'a str>,
    pub vault_name: &'a str,
}

/// Management-plane view of a vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultDescriptor {
    pub name: String,
    /// Data-plane address, when the lookup returned one
    pub vault_uri: Option<String>,
}

/// Data-plane address of a vault plus the token used to call it
#[derive(Debug, Clone)]
pub struct VaultEndpoint {
    pub uri: String,
    pub token: AccessToken,
}

/// Exclusivity token for a leased object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchanges service-principal credentials for access tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_token(&self, request: &TokenRequest<'_>) -> RemoteResult<AccessToken>;
}

/// Resource-manager operations
#[async_trait]
pub trait ManagementPlane: Send + Sync {
    /// Load endpoint metadata published by a custom resource-manager endpoint
    async fn environment_metadata(&self, endpoint: &Url) -> RemoteResult<CloudEnvironment>;

    /// Look up a vault; `Ok(None)` when it does not exist
    async fn get_vault(
        &self,
        token: &AccessToken,
        lookup: &VaultLookup<'_>,
    ) -> RemoteResult<Option<VaultDescriptor>>;
}

/// Secret, metadata and lease operations against one vault
///
/// A live lease on `name` guards both its metadata and its value: writes
/// must carry the live token and are rejected with
/// [`RemoteError::LeaseMismatch`] otherwise.
#[async_trait]
pub trait VaultDataPlane: Send + Sync {
    /// Read the latest (or the given) version; `Ok(None)` when absent
    async fn get_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        version: Option<&str>,
    ) -> RemoteResult<Option<Vec<u8>>>;

    /// Create a new version of the secret
    async fn set_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        value: &[u8],
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()>;

    async fn delete_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()>;

    async fn get_metadata(&self, vault: &VaultEndpoint, name: &str) -> RemoteResult<Metadata>;

    /// Replace the metadata; requires the live lease
    async fn set_metadata(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        metadata: &Metadata,
        lease: &LeaseToken,
    ) -> RemoteResult<()>;

    /// Take a lease under the proposed id, failing with
    /// [`RemoteError::LeaseConflict`] while another lease is live
    async fn acquire_lease(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        proposed: &LeaseToken,
        duration: Duration,
    ) -> RemoteResult<LeaseToken>;

    async fn release_lease(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        lease: &LeaseToken,
    ) -> RemoteResult<()>;
}

/// The three remote capabilities a backend is configured with
#[derive(Clone)]
pub struct RemoteServices {
    pub identity: Arc<dyn IdentityProvider>,
    pub management: Arc<dyn ManagementPlane>,
    pub data_plane: Arc<dyn VaultDataPlane>,
}

impl RemoteServices {
    /// Services backed by the Azure REST APIs
    pub fn azure(request_timeout: Duration) -> RemoteResult<Self> {
        let client = azure::AzureRestClient::new(request_timeout)?;
        Ok(Self::from_shared(Arc::new(client)))
    }

    /// Use one object for all three capabilities
    pub fn from_shared<T>(service: Arc<T>) -> Self
    where
        T: IdentityProvider + ManagementPlane + VaultDataPlane + 'static,
    {
        Self {
            identity: service.clone(),
            management: service.clone(),
            data_plane: service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_debug_hides_token() {
        let token = AccessToken {
            token: "super-secret-value".to_string(),
            expires_on: Utc::now(),
            audience: "https://vault.azure.net".to_string(),
        };
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("vault.azure.net"));
        assert_eq!(token.bearer(), "Bearer super-secret-value");
    }

    #[test]
    fn test_remote_error_display() {
        let error = RemoteError::Service {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(error.to_string(), "service returned 500: boom");
    }
}
