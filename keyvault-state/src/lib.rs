//! Key Vault State Storage
//!
//! This crate stores infrastructure state in an Azure Key Vault secret, with
//! a lease-based lock for safe concurrent access.
//!
//! # Overview
//!
//! The backend consists of:
//!
//! - **StateBackend**: The get/put/delete/lock/unlock contract
//! - **RemoteStateClient**: The Key Vault implementation of that contract
//! - **LockInfo**: Who holds a lock, stored in the secret's metadata
//! - **remote**: The seams to the identity provider, ARM and the vault data
//!   plane, with an in-memory implementation for tests
//!
//! # Example
//!
//! ```ignore
//! use keyvault_state::{create_backend, LockDescriptor, RawBackendConfig, StatePayload};
//!
//! let config = RawBackendConfig {
//!     keyvault_name: Some("my-state-vault".to_string()),
//!     keyvault_prefix: Some("infra/prod".to_string()),
//!     ..Default::default()
//! };
//!
//! // Credentials come from ARM_CLIENT_ID, ARM_CLIENT_SECRET, ARM_TENANT_ID
//! // and ARM_SUBSCRIPTION_ID when not set on the config
//! let backend = create_backend(&config).await?;
//!
//! // Acquire lock before modifying state
//! let lock_id = backend.lock(&LockDescriptor::new("apply")).await?;
//!
//! // Read current state
//! let state = backend.get().await?;
//!
//! // ... modify resources ...
//!
//! // Write updated state
//! backend.put(&StatePayload::from("{}")).await?;
//!
//! // Release lock
//! backend.unlock(&lock_id).await?;
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credential;
pub mod environment;
pub mod lock;
pub mod remote;
pub mod secret_store;
pub mod session;
pub mod state;

// Re-export main types for convenience
pub use backend::{AuthFailure, BackendError, BackendResult, StateBackend};
pub use client::{RemoteStateClient, create_backend};
pub use config::{BackendConfig, RawBackendConfig};
pub use environment::CloudEnvironment;
pub use lock::{LockDescriptor, LockInfo};
pub use state::{StatePath, StatePayload};
