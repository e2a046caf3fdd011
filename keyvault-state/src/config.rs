//! Backend configuration
//!
//! [`RawBackendConfig`] mirrors the attributes written in a backend block.
//! [`RawBackendConfig::resolve`] validates it once and produces the typed
//! [`BackendConfig`] the rest of the crate works with. Environment variables
//! and deprecated aliases are consulted in a fixed priority order.

use std::fmt;
use std::time::Duration;

use log::warn;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::backend::{BackendError, BackendResult};
use crate::lock::DEFAULT_LEASE_DURATION_SECS;

/// Cloud environment used when none is configured
pub const DEFAULT_ENVIRONMENT: &str = "public";

/// Lock acquisition should fail fast under contention
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Token exchange and vault lookup
pub const DEFAULT_MANAGEMENT_TIMEOUT_SECS: u64 = 300;

/// Key Vault allows 127 characters; the rest is kept for the `-lock` companion
const MAX_SECRET_NAME_LEN: usize = 120;

/// Unvalidated backend attributes
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawBackendConfig {
    pub keyvault_name: Option<String>,
    pub keyvault_prefix: Option<String>,
    pub key: Option<String>,
    pub environment: Option<String>,
    pub endpoint: Option<String>,
    pub resource_group_name: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,

    // Deprecated aliases
    pub arm_client_id: Option<String>,
    pub arm_client_secret: Option<String>,
    pub arm_subscription_id: Option<String>,
    pub arm_tenant_id: Option<String>,

    pub lock_timeout_secs: Option<u64>,
    pub lease_duration_secs: Option<u64>,
    pub management_timeout_secs: Option<u64>,
}

/// One place a setting can come from
enum Source<'a> {
    Field(Option<&'a String>),
    Env(&'static str),
    Deprecated {
        name: &'static str,
        replacement: &'static str,
        value: Option<&'a String>,
    },
}

/// Walk the sources in order; the first non-empty value wins
fn first_non_empty<F>(sources: &[Source<'_>], env: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for source in sources {
        let value = match source {
            Source::Field(value) => (*value).cloned(),
            Source::Env(var) => env(*var),
            Source::Deprecated {
                name,
                replacement,
                value,
            } => {
                let value = (*value).filter(|v| !v.is_empty()).cloned();
                if value.is_some() {
                    warn!("`{}` is deprecated, use `{}` instead", name, replacement);
                }
                value
            }
        };

        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            return Some(value);
        }
    }
    None
}

impl RawBackendConfig {
    /// Resolve using the process environment
    pub fn resolve(&self) -> BackendResult<BackendConfig> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup
    pub fn resolve_with<F>(&self, env: F) -> BackendResult<BackendConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault_name = first_non_empty(&[Source::Field(self.keyvault_name.as_ref())], &env)
            .ok_or_else(|| BackendError::configuration("Missing required attribute: keyvault_name"))?;

        let prefix = first_non_empty(&[Source::Field(self.keyvault_prefix.as_ref())], &env)
            .ok_or_else(|| {
                BackendError::configuration("Missing required attribute: keyvault_prefix")
            })?;

        let secret_name = secret_name(&prefix, self.key.as_deref())?;

        let client_id = first_non_empty(
            &[
                Source::Field(self.client_id.as_ref()),
                Source::Env("ARM_CLIENT_ID"),
                Source::Deprecated {
                    name: "arm_client_id",
                    replacement: "client_id",
                    value: self.arm_client_id.as_ref(),
                },
            ],
            &env,
        );

        let client_secret = first_non_empty(
            &[
                Source::Field(self.client_secret.as_ref()),
                Source::Env("ARM_CLIENT_SECRET"),
                Source::Deprecated {
                    name: "arm_client_secret",
                    replacement: "client_secret",
                    value: self.arm_client_secret.as_ref(),
                },
            ],
            &env,
        );

        let subscription_id = first_non_empty(
            &[
                Source::Field(self.subscription_id.as_ref()),
                Source::Env("ARM_SUBSCRIPTION_ID"),
                Source::Deprecated {
                    name: "arm_subscription_id",
                    replacement: "subscription_id",
                    value: self.arm_subscription_id.as_ref(),
                },
            ],
            &env,
        );

        let tenant_id = first_non_empty(
            &[
                Source::Field(self.tenant_id.as_ref()),
                Source::Env("ARM_TENANT_ID"),
                Source::Deprecated {
                    name: "arm_tenant_id",
                    replacement: "tenant_id",
                    value: self.arm_tenant_id.as_ref(),
                },
            ],
            &env,
        );

        let environment = first_non_empty(
            &[
                Source::Field(self.environment.as_ref()),
                Source::Env("ARM_ENVIRONMENT"),
            ],
            &env,
        )
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let custom_endpoint = first_non_empty(
            &[Source::Field(self.endpoint.as_ref()), Source::Env("ARM_ENDPOINT")],
            &env,
        );

        let resource_group_name =
            first_non_empty(&[Source::Field(self.resource_group_name.as_ref())], &env);

        Ok(BackendConfig {
            vault_name,
            secret_name,
            resource_group_name,
            environment,
            custom_endpoint,
            client_id,
            client_secret: client_secret.map(ClientSecret::new),
            subscription_id,
            tenant_id,
            lock_timeout: Duration::from_secs(
                self.lock_timeout_secs.unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            ),
            lease_duration: Duration::from_secs(
                self.lease_duration_secs.unwrap_or(DEFAULT_LEASE_DURATION_SECS),
            ),
            management_timeout: Duration::from_secs(
                self.management_timeout_secs
                    .unwrap_or(DEFAULT_MANAGEMENT_TIMEOUT_SECS),
            ),
        })
    }
}

/// Service principal secret; zeroed on drop and never printed
#[derive(Clone)]
pub struct ClientSecret(Zeroizing<String>);

impl ClientSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret(***)")
    }
}

/// Validated backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub vault_name: String,
    /// Name of the secret holding the state
    pub secret_name: String,
    pub resource_group_name: Option<String>,
    /// Named cloud environment, used when no custom endpoint is set
    pub environment: String,
    /// Custom resource-manager endpoint; overrides `environment`
    pub custom_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<ClientSecret>,
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub lock_timeout: Duration,
    pub lease_duration: Duration,
    pub management_timeout: Duration,
}

impl BackendConfig {
    /// Configuration with defaults and no credentials
    pub fn new(vault_name: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            vault_name: vault_name.into(),
            secret_name: secret_name.into(),
            resource_group_name: None,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            custom_endpoint: None,
            client_id: None,
            client_secret: None,
            subscription_id: None,
            tenant_id: None,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            management_timeout: Duration::from_secs(DEFAULT_MANAGEMENT_TIMEOUT_SECS),
        }
    }

    pub fn with_service_principal(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tenant_id: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(ClientSecret::new(client_secret));
        self.tenant_id = Some(tenant_id.into());
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_resource_group(mut self, resource_group: impl Into<String>) -> Self {
        self.resource_group_name = Some(resource_group.into());
        self
    }
}

/// Build the secret name from the prefix and optional key
///
/// `/`, `_`, `.` and spaces become `-`; anything else outside
/// `[0-9A-Za-z-]` is rejected.
pub fn secret_name(prefix: &str, key: Option<&str>) -> BackendResult<String> {
    let raw = match key.filter(|k| !k.is_empty()) {
        Some(key) => format!("{}-{}", prefix, key),
        None => prefix.to_string(),
    };

    let name: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '_' | '.' | ' ' => '-',
            c => c,
        })
        .collect();

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
    {
        return Err(BackendError::configuration(format!(
            "Invalid character {:?} in secret name {:?}",
            bad, raw
        )));
    }

    if name.is_empty() || name.len() > MAX_SECRET_NAME_LEN {
        return Err(BackendError::configuration(format!(
            "Secret name must be 1 to {} characters, got {:?}",
            MAX_SECRET_NAME_LEN, name
        )));
    }

    Ok(name)
}
