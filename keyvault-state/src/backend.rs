//! State backend trait and error types

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::lock::{LockDescriptor, LockInfo};
use crate::remote::RemoteError;
use crate::state::StatePayload;

/// Why authentication failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// A required credential field is absent or empty
    MissingCredential,
    /// The environment name or custom endpoint could not be resolved
    InvalidEndpoint,
    /// The identity provider rejected the request or could not be reached
    TokenExchangeFailed,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AuthFailure::MissingCredential => "missing credential",
            AuthFailure::InvalidEndpoint => "invalid endpoint",
            AuthFailure::TokenExchangeFailed => "token exchange failed",
        };
        f.write_str(reason)
    }
}

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Credential or token failure; never retried
    #[error("Authentication failed ({reason}): {message}")]
    Auth {
        reason: AuthFailure,
        message: String,
        #[source]
        source: Option<RemoteError>,
    },

    /// The key vault does not exist
    #[error("Key vault not found: {vault} (in {scope})")]
    VaultNotFound { vault: String, scope: String },

    /// A read failed; the caller may retry
    #[error("{operation} on {path} failed: {source}")]
    Transient {
        operation: &'static str,
        path: String,
        #[source]
        source: RemoteError,
    },

    /// A bounded operation did not finish in time
    #[error("{operation} on {path} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        path: String,
        after: Duration,
    },

    /// The state is locked by another holder
    #[error("State is locked by {who} since {created} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
        created: DateTime<Utc>,
    },

    /// Another process holds the lease but its lock record is not visible yet
    #[error("State at {path} is leased by another process that has not recorded its lock yet")]
    LeaseHeld { path: String },

    /// The lock was not found (for unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// A write was attempted and failed; the remote state is unknown
    #[error("{operation} on {path} failed: {source}")]
    Write {
        operation: &'static str,
        path: String,
        #[source]
        source: RemoteError,
    },

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The stored lock record could not be decoded
    #[error("Invalid lock info: {0}")]
    InvalidLockInfo(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
            created: lock.created,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn auth(reason: AuthFailure, message: impl Into<String>) -> Self {
        Self::Auth {
            reason,
            message: message.into(),
            source: None,
        }
    }

    pub fn auth_caused_by(reason: AuthFailure, message: impl Into<String>, cause: RemoteError) -> Self {
        Self::Auth {
            reason,
            message: message.into(),
            source: Some(cause),
        }
    }

    pub fn transient(operation: &'static str, path: impl fmt::Display, source: RemoteError) -> Self {
        Self::Transient {
            operation,
            path: path.to_string(),
            source,
        }
    }

    pub fn write(operation: &'static str, path: impl fmt::Display, source: RemoteError) -> Self {
        Self::Write {
            operation,
            path: path.to_string(),
            source,
        }
    }

    /// A failed data-plane read; a rejected credential is an auth failure
    pub fn remote_read(operation: &'static str, path: impl fmt::Display, source: RemoteError) -> Self {
        match source {
            RemoteError::Unauthorized(_) => Self::credential_rejected(operation, path, source),
            source => Self::transient(operation, path, source),
        }
    }

    /// A failed data-plane write; a rejected credential is an auth failure
    pub fn remote_write(operation: &'static str, path: impl fmt::Display, source: RemoteError) -> Self {
        match source {
            RemoteError::Unauthorized(_) => Self::credential_rejected(operation, path, source),
            source => Self::write(operation, path, source),
        }
    }

    fn credential_rejected(operation: &'static str, path: impl fmt::Display, source: RemoteError) -> Self {
        Self::auth_caused_by(
            AuthFailure::TokenExchangeFailed,
            format!("Vault rejected the credential during {} on {}", operation, path),
            source,
        )
    }

    pub fn timeout(operation: &'static str, path: impl fmt::Display, after: Duration) -> Self {
        Self::Timeout {
            operation,
            path: path.to_string(),
            after,
        }
    }

    /// Whether repeating the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Another holder owns the lock
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::LeaseHeld { .. })
    }

    pub fn is_lock_error(&self) -> bool {
        self.is_lock_conflict()
            || matches!(self, Self::LockNotFound(_) | Self::LockMismatch { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for remote state backends
///
/// This is the contract the engine's state layer consumes: read, write and
/// delete the state payload, and serialize writers with a lock.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the current state
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn get(&self) -> BackendResult<Option<StatePayload>>;

    /// Write a new version of the state
    ///
    /// After a failure the stored state is unknown; read it again instead of
    /// assuming a rollback
    async fn put(&self, payload: &StatePayload) -> BackendResult<()>;

    /// Delete the state
    async fn delete(&self) -> BackendResult<()>;

    /// Acquire the state lock and return its id
    ///
    /// Fails with [`BackendError::Locked`] while another holder owns it
    async fn lock(&self, descriptor: &LockDescriptor) -> BackendResult<String>;

    /// Release a lock previously returned by [`StateBackend::lock`]
    async fn unlock(&self, lock_id: &str) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePath;

    #[test]
    fn test_backend_error_locked() {
        let path = StatePath::new("vault", "state");
        let lock = LockInfo::new(
            &LockDescriptor::new("apply"),
            &path,
            Duration::from_secs(60),
        );
        let error = BackendError::locked(&lock);

        match error {
            BackendError::Locked {
                lock_id,
                who,
                operation,
                created,
            } => {
                assert_eq!(lock_id, lock.id);
                assert_eq!(who, lock.who);
                assert_eq!(operation, "apply");
                assert_eq!(created, lock.created);
            }
            _ => panic!("Expected Locked error"),
        }
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::auth(AuthFailure::MissingCredential, "client_id is empty");
        assert_eq!(
            error.to_string(),
            "Authentication failed (missing credential): client_id is empty"
        );

        let error = BackendError::LockMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        };
        assert_eq!(error.to_string(), "Lock ID mismatch: expected a, got b");
    }

    #[test]
    fn test_error_classification() {
        let transient = BackendError::transient(
            "read state",
            "vault/state",
            RemoteError::Transport("connection reset".to_string()),
        );
        assert!(transient.is_retryable());
        assert!(!transient.is_lock_error());

        let write = BackendError::write(
            "write state",
            "vault/state",
            RemoteError::Transport("connection reset".to_string()),
        );
        assert!(!write.is_retryable());

        let rejected = BackendError::remote_read(
            "read state",
            "vault/state",
            RemoteError::Unauthorized("token expired".to_string()),
        );
        assert!(matches!(
            rejected,
            BackendError::Auth {
                reason: AuthFailure::TokenExchangeFailed,
                ..
            }
        ));
        assert!(!rejected.is_retryable());

        let reset = BackendError::remote_read(
            "read state",
            "vault/state",
            RemoteError::Transport("connection reset".to_string()),
        );
        assert!(reset.is_retryable());

        let held = BackendError::LeaseHeld {
            path: "vault/state".to_string(),
        };
        assert!(held.is_lock_conflict());
        assert!(BackendError::LockNotFound("x".to_string()).is_lock_error());
        assert!(!BackendError::LockNotFound("x".to_string()).is_lock_conflict());
    }
}
