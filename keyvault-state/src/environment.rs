//! Azure cloud environments

use std::time::Duration;

use log::debug;
use url::Url;

use crate::backend::{AuthFailure, BackendError, BackendResult};
use crate::config::BackendConfig;
use crate::remote::ManagementPlane;

/// Endpoints and token audiences of one Azure cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEnvironment {
    pub name: String,
    pub resource_manager_endpoint: String,
    pub active_directory_endpoint: String,
    /// Audience of management-plane tokens
    pub management_audience: String,
    /// DNS suffix of vault data-plane hosts, without a leading dot
    pub key_vault_dns_suffix: String,
    /// Audience of data-plane tokens
    pub key_vault_audience: String,
}

impl CloudEnvironment {
    pub fn public() -> Self {
        Self::well_known(
            "AzurePublicCloud",
            "https://management.azure.com/",
            "https://login.microsoftonline.com/",
            "vault.azure.net",
        )
    }

    pub fn us_government() -> Self {
        Self::well_known(
            "AzureUSGovernmentCloud",
            "https://management.usgovcloudapi.net/",
            "https://login.microsoftonline.us/",
            "vault.usgovcloudapi.net",
        )
    }

    pub fn china() -> Self {
        Self::well_known(
            "AzureChinaCloud",
            "https://management.chinacloudapi.cn/",
            "https://login.chinacloudapi.cn/",
            "vault.azure.cn",
        )
    }

    pub fn german() -> Self {
        Self::well_known(
            "AzureGermanCloud",
            "https://management.microsoftazure.de/",
            "https://login.microsoftonline.de/",
            "vault.microsoftazure.de",
        )
    }

    fn well_known(name: &str, resource_manager: &str, active_directory: &str, dns_suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_manager_endpoint: resource_manager.to_string(),
            active_directory_endpoint: active_directory.to_string(),
            management_audience: resource_manager.to_string(),
            key_vault_dns_suffix: dns_suffix.to_string(),
            key_vault_audience: format!("https://{}", dns_suffix),
        }
    }

    /// Look up a named environment (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "public" | "azurepubliccloud" => Some(Self::public()),
            "usgovernment" | "azureusgovernmentcloud" => Some(Self::us_government()),
            "china" | "azurechinacloud" => Some(Self::china()),
            "german" | "azuregermancloud" => Some(Self::german()),
            _ => None,
        }
    }

    /// Data-plane address of a vault in this environment
    pub fn vault_uri(&self, vault_name: &str) -> String {
        format!("https://{}.{}/", vault_name, self.key_vault_dns_suffix)
    }
}

/// Determine the environment for a configuration
///
/// A custom endpoint wins over the named environment. Its metadata is
/// fetched through the management plane within `timeout`.
pub async fn resolve_environment(
    config: &BackendConfig,
    management: &dyn ManagementPlane,
    timeout: Duration,
) -> BackendResult<CloudEnvironment> {
    if let Some(endpoint) = config.custom_endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        debug!("Loading environment from endpoint {:?}", endpoint);

        let url = Url::parse(endpoint).map_err(|e| {
            BackendError::auth(
                AuthFailure::InvalidEndpoint,
                format!("Custom endpoint {:?} is not a valid URL: {}", endpoint, e),
            )
        })?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(BackendError::auth(
                AuthFailure::InvalidEndpoint,
                format!("Custom endpoint {:?} must use http(s)", endpoint),
            ));
        }

        return match tokio::time::timeout(timeout, management.environment_metadata(&url)).await {
            Ok(Ok(environment)) => Ok(environment),
            Ok(Err(err)) => Err(BackendError::auth_caused_by(
                AuthFailure::InvalidEndpoint,
                format!("Failed to load environment from {:?}", endpoint),
                err,
            )),
            Err(_) => Err(BackendError::auth(
                AuthFailure::InvalidEndpoint,
                format!(
                    "Loading environment from {:?} timed out after {:?}",
                    endpoint, timeout
                ),
            )),
        };
    }

    debug!("Loading environment {:?}", config.environment);
    CloudEnvironment::from_name(&config.environment).ok_or_else(|| {
        BackendError::auth(
            AuthFailure::InvalidEndpoint,
            format!("Unknown Azure environment {:?}", config.environment),
        )
    })
}
