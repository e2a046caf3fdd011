//! Azure REST implementation of the remote traits
//!
//! Tokens come from the Active Directory v2 endpoint (client-credentials
//! grant), vaults are located through Azure Resource Manager and secrets are
//! read and written through the Key Vault REST API.
//!
//! Key Vault has no lease or conditional-write primitive. Lease and metadata
//! of a secret `name` therefore live in a companion secret `name-lock` whose
//! value is a JSON [`LockRecord`]. Acquiring a lease writes the record and
//! reads it back to confirm this writer won.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    AccessToken, IdentityProvider, LeaseToken, ManagementPlane, Metadata, RemoteError,
    RemoteResult, TokenRequest, VaultDataPlane, VaultDescriptor, VaultEndpoint, VaultLookup,
};
use crate::environment::CloudEnvironment;

const KEY_VAULT_API_VERSION: &str = "7.4";
const VAULTS_API_VERSION: &str = "2022-07-01";
const RESOURCES_API_VERSION: &str = "2021-04-01";
const METADATA_API_VERSION: &str = "2022-09-01";

/// Content type marking a secret value as base64-encoded bytes
const PAYLOAD_CONTENT_TYPE: &str = "application/octet-stream;base64";
const LOCK_CONTENT_TYPE: &str = "application/json";
const LOCK_SECRET_SUFFIX: &str = "-lock";

/// HTTP client for the identity provider, ARM and Key Vault
pub struct AzureRestClient {
    http: Client,
}

impl AzureRestClient {
    pub fn new(request_timeout: Duration) -> RemoteResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn secret_url(vault: &VaultEndpoint, name: &str, version: Option<&str>) -> String {
        let base = vault.uri.trim_end_matches('/');
        match version {
            Some(version) => format!("{}/secrets/{}/{}", base, name, version),
            None => format!("{}/secrets/{}", base, name),
        }
    }

    /// Read a secret bundle; `Ok(None)` when absent
    async fn read_bundle(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        version: Option<&str>,
    ) -> RemoteResult<Option<SecretBundle>> {
        let response = self
            .http
            .get(Self::secret_url(vault, name, version))
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .header("Authorization", vault.token.bearer())
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bundle = check(response)
            .await?
            .json::<SecretBundle>()
            .await
            .map_err(|e| RemoteError::Encoding(format!("Invalid secret bundle for {}: {}", name, e)))?;
        Ok(Some(bundle))
    }

    async fn write_bundle(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        value: String,
        content_type: &str,
    ) -> RemoteResult<()> {
        let body = SetSecretRequest {
            value,
            content_type: content_type.to_string(),
        };
        let response = self
            .http
            .put(Self::secret_url(vault, name, None))
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .header("Authorization", vault.token.bearer())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    async fn read_lock_record(&self, vault: &VaultEndpoint, name: &str) -> RemoteResult<LockRecord> {
        let companion = format!("{}{}", name, LOCK_SECRET_SUFFIX);
        match self.read_bundle(vault, &companion, None).await? {
            Some(bundle) => serde_json::from_str(&bundle.value).map_err(|e| {
                RemoteError::Encoding(format!("Invalid lock record in {}: {}", companion, e))
            }),
            None => Ok(LockRecord::default()),
        }
    }

    async fn write_lock_record(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        record: &LockRecord,
    ) -> RemoteResult<()> {
        let companion = format!("{}{}", name, LOCK_SECRET_SUFFIX);
        let value = serde_json::to_string(record)
            .map_err(|e| RemoteError::Encoding(format!("Failed to encode lock record: {}", e)))?;
        self.write_bundle(vault, &companion, value, LOCK_CONTENT_TYPE).await
    }

    /// Apply the lease rules to a write against `name`
    async fn check_lease(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        supplied: Option<&LeaseToken>,
    ) -> RemoteResult<LockRecord> {
        let record = self.read_lock_record(vault, name).await?;
        record.authorize(name, supplied)?;
        Ok(record)
    }
}

/// Lease and metadata of a protected secret
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LockRecord {
    #[serde(default)]
    lease_id: Option<String>,
    #[serde(default)]
    lease_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Metadata,
}

impl LockRecord {
    fn live_lease(&self) -> Option<&str> {
        match (&self.lease_id, self.lease_expires) {
            (Some(id), Some(expires)) if expires > Utc::now() => Some(id.as_str()),
            _ => None,
        }
    }

    /// A write must carry the live lease, and only the live lease
    fn authorize(&self, name: &str, supplied: Option<&LeaseToken>) -> RemoteResult<()> {
        match (self.live_lease(), supplied) {
            (None, None) => Ok(()),
            (Some(live), Some(supplied)) if live == supplied.as_str() => Ok(()),
            (Some(_), _) => Err(RemoteError::LeaseMismatch(format!(
                "{} is leased under a different id",
                name
            ))),
            (None, Some(_)) => Err(RemoteError::LeaseMismatch(format!(
                "{} has no live lease",
                name
            ))),
        }
    }

    /// Record a lease for `proposed` unless another one is live
    fn grant(&mut self, name: &str, proposed: &LeaseToken, duration: Duration) -> RemoteResult<()> {
        if self
            .live_lease()
            .is_some_and(|live| live != proposed.as_str())
        {
            return Err(RemoteError::LeaseConflict(name.to_string()));
        }

        let lifetime = TimeDelta::from_std(duration)
            .map_err(|e| RemoteError::Encoding(format!("Lease duration out of range: {}", e)))?;
        self.lease_id = Some(proposed.as_str().to_string());
        self.lease_expires = Some(Utc::now() + lifetime);
        Ok(())
    }

    fn is_held_by(&self, lease: &LeaseToken) -> bool {
        self.live_lease() == Some(lease.as_str())
    }

    fn release(&mut self, name: &str, lease: &LeaseToken) -> RemoteResult<()> {
        self.authorize(name, Some(lease))?;
        self.lease_id = None;
        self.lease_expires = None;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundle {
    #[serde(default)]
    value: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetSecretRequest {
    value: String,
    content_type: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct VaultResource {
    name: String,
    #[serde(default)]
    properties: Option<VaultProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultProperties {
    #[serde(default)]
    vault_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    value: Vec<VaultResource>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MetadataDocument {
    Many(Vec<CloudMetadata>),
    One(CloudMetadata),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    resource_manager: Option<String>,
    authentication: AuthenticationMetadata,
    #[serde(default)]
    suffixes: SuffixMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationMetadata {
    login_endpoint: String,
    #[serde(default)]
    audiences: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuffixMetadata {
    #[serde(default)]
    key_vault_dns: Option<String>,
}

impl CloudMetadata {
    fn into_environment(self, endpoint: &Url) -> CloudEnvironment {
        let resource_manager = self
            .resource_manager
            .unwrap_or_else(|| endpoint.to_string());
        let management_audience = self
            .authentication
            .audiences
            .into_iter()
            .next()
            .unwrap_or_else(|| resource_manager.clone());
        let dns_suffix = self
            .suffixes
            .key_vault_dns
            .map(|s| s.trim_start_matches('.').to_string())
            .unwrap_or_else(|| CloudEnvironment::public().key_vault_dns_suffix);

        CloudEnvironment {
            name: self.name.unwrap_or_else(|| "custom".to_string()),
            resource_manager_endpoint: resource_manager,
            active_directory_endpoint: self.authentication.login_endpoint,
            management_audience,
            key_vault_audience: format!("https://{}", dns_suffix),
            key_vault_dns_suffix: dns_suffix,
        }
    }
}

#[async_trait]
impl IdentityProvider for AzureRestClient {
    async fn exchange_token(&self, request: &TokenRequest<'_>) -> RemoteResult<AccessToken> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            request.authority.trim_end_matches('/'),
            request.tenant_id
        );
        let scope = format!("{}/.default", request.audience.trim_end_matches('/'));
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", request.client_id),
            ("client_secret", request.client_secret),
            ("scope", scope.as_str()),
        ];

        debug!("Requesting token for {} from {}", request.audience, url);
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(transport)?;

        let token = check(response)
            .await?
            .json::<TokenResponse>()
            .await
            .map_err(|e| RemoteError::Encoding(format!("Invalid token response: {}", e)))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_on: Utc::now() + TimeDelta::seconds(token.expires_in),
            audience: request.audience.to_string(),
        })
    }
}

#[async_trait]
impl ManagementPlane for AzureRestClient {
    async fn environment_metadata(&self, endpoint: &Url) -> RemoteResult<CloudEnvironment> {
        let url = endpoint
            .join("metadata/endpoints")
            .map_err(|e| RemoteError::Transport(format!("Invalid metadata URL: {}", e)))?;

        let response = self
            .http
            .get(url)
            .query(&[("api-version", METADATA_API_VERSION)])
            .send()
            .await
            .map_err(transport)?;

        let document = check(response)
            .await?
            .json::<MetadataDocument>()
            .await
            .map_err(|e| RemoteError::Encoding(format!("Invalid endpoint metadata: {}", e)))?;

        let wanted = endpoint.as_str().trim_end_matches('/');
        let cloud = match document {
            MetadataDocument::One(cloud) => cloud,
            MetadataDocument::Many(clouds) => {
                let mut clouds = clouds.into_iter();
                let first = clouds
                    .next()
                    .ok_or_else(|| RemoteError::Encoding("Endpoint metadata lists no clouds".to_string()))?;
                let same_endpoint = |cloud: &CloudMetadata| {
                    cloud
                        .resource_manager
                        .as_deref()
                        .is_some_and(|rm| rm.trim_end_matches('/') == wanted)
                };
                if same_endpoint(&first) {
                    first
                } else {
                    clouds.find(|cloud| same_endpoint(cloud)).unwrap_or(first)
                }
            }
        };

        Ok(cloud.into_environment(endpoint))
    }

    async fn get_vault(
        &self,
        token: &AccessToken,
        lookup: &VaultLookup<'_>,
    ) -> RemoteResult<Option<VaultDescriptor>> {
        let base = lookup.resource_manager.trim_end_matches('/');

        match lookup.resource_group {
            Some(group) => {
                let url = format!(
                    "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.KeyVault/vaults/{}",
                    base, lookup.subscription_id, group, lookup.vault_name
                );
                let response = self
                    .http
                    .get(&url)
                    .query(&[("api-version", VAULTS_API_VERSION)])
                    .header("Authorization", token.bearer())
                    .send()
                    .await
                    .map_err(transport)?;

                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let vault = check(response)
                    .await?
                    .json::<VaultResource>()
                    .await
                    .map_err(|e| RemoteError::Encoding(format!("Invalid vault resource: {}", e)))?;

                Ok(Some(VaultDescriptor {
                    name: vault.name,
                    vault_uri: vault.properties.and_then(|p| p.vault_uri),
                }))
            }
            None => {
                let url = format!("{}/subscriptions/{}/resources", base, lookup.subscription_id);
                let filter = format!(
                    "resourceType eq 'Microsoft.KeyVault/vaults' and name eq '{}'",
                    lookup.vault_name
                );
                let response = self
                    .http
                    .get(&url)
                    .query(&[
                        ("$filter", filter.as_str()),
                        ("api-version", RESOURCES_API_VERSION),
                    ])
                    .header("Authorization", token.bearer())
                    .send()
                    .await
                    .map_err(transport)?;

                let resources = check(response)
                    .await?
                    .json::<ResourceList>()
                    .await
                    .map_err(|e| RemoteError::Encoding(format!("Invalid resource list: {}", e)))?;

                Ok(resources
                    .value
                    .into_iter()
                    .find(|vault| vault.name.eq_ignore_ascii_case(lookup.vault_name))
                    .map(|vault| VaultDescriptor {
                        name: vault.name,
                        vault_uri: vault.properties.and_then(|p| p.vault_uri),
                    }))
            }
        }
    }
}

#[async_trait]
impl VaultDataPlane for AzureRestClient {
    async fn get_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        version: Option<&str>,
    ) -> RemoteResult<Option<Vec<u8>>> {
        let Some(bundle) = self.read_bundle(vault, name, version).await? else {
            return Ok(None);
        };

        match bundle.content_type.as_deref() {
            Some(PAYLOAD_CONTENT_TYPE) => STANDARD
                .decode(bundle.value.as_bytes())
                .map(Some)
                .map_err(|e| RemoteError::Encoding(format!("Secret {} is not base64: {}", name, e))),
            _ => Ok(Some(bundle.value.into_bytes())),
        }
    }

    async fn set_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        value: &[u8],
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()> {
        self.check_lease(vault, name, lease).await?;
        self.write_bundle(vault, name, STANDARD.encode(value), PAYLOAD_CONTENT_TYPE)
            .await
    }

    async fn delete_secret(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        lease: Option<&LeaseToken>,
    ) -> RemoteResult<()> {
        self.check_lease(vault, name, lease).await?;

        let response = self
            .http
            .delete(Self::secret_url(vault, name, None))
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .header("Authorization", vault.token.bearer())
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;

        // Soft-deleted names cannot be reused until purged. Purging fails
        // while the deletion is still in progress or purge protection is on.
        let purge = self
            .http
            .delete(format!(
                "{}/deletedsecrets/{}",
                vault.uri.trim_end_matches('/'),
                name
            ))
            .query(&[("api-version", KEY_VAULT_API_VERSION)])
            .header("Authorization", vault.token.bearer())
            .send()
            .await;
        match purge {
            Ok(response) if response.status().is_success() => debug!("Purged secret {}", name),
            Ok(response) => debug!("Secret {} not purged: {}", name, response.status()),
            Err(err) => debug!("Secret {} not purged: {}", name, err),
        }
        Ok(())
    }

    async fn get_metadata(&self, vault: &VaultEndpoint, name: &str) -> RemoteResult<Metadata> {
        Ok(self.read_lock_record(vault, name).await?.metadata)
    }

    async fn set_metadata(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        metadata: &Metadata,
        lease: &LeaseToken,
    ) -> RemoteResult<()> {
        let mut record = self.check_lease(vault, name, Some(lease)).await?;
        record.metadata = metadata.clone();
        self.write_lock_record(vault, name, &record).await
    }

    async fn acquire_lease(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        proposed: &LeaseToken,
        duration: Duration,
    ) -> RemoteResult<LeaseToken> {
        let mut record = self.read_lock_record(vault, name).await?;
        record.grant(name, proposed, duration)?;
        self.write_lock_record(vault, name, &record).await?;

        // Without conditional writes the last writer wins; read back to see
        // whether that was us
        let confirmed = self.read_lock_record(vault, name).await?;
        if !confirmed.is_held_by(proposed) {
            return Err(RemoteError::LeaseConflict(name.to_string()));
        }
        Ok(proposed.clone())
    }

    async fn release_lease(
        &self,
        vault: &VaultEndpoint,
        name: &str,
        lease: &LeaseToken,
    ) -> RemoteResult<()> {
        let mut record = self.read_lock_record(vault, name).await?;
        record.release(name, lease)?;
        self.write_lock_record(vault, name, &record).await
    }
}

/// Map an unsuccessful response to a remote error
async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(body),
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        StatusCode::CONFLICT => RemoteError::Service {
            status: status.as_u16(),
            message: format!("conflict (is a soft-deleted secret waiting to be purged?): {}", body),
        },
        _ => RemoteError::Service {
            status: status.as_u16(),
            message: body,
        },
    })
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

/// User agent, extended by `AZURE_HTTP_USER_AGENT` when set (e.g. Cloud Shell)
fn user_agent() -> String {
    let base = concat!("keyvault-state/", env!("CARGO_PKG_VERSION"));
    match std::env::var("AZURE_HTTP_USER_AGENT") {
        Ok(extra) if !extra.is_empty() => format!("{} {}", base, extra),
        _ => base.to_string(),
    }
}
