//! Reading and writing the state secret

use std::sync::Arc;

use log::{debug, info};

use crate::backend::{BackendError, BackendResult};
use crate::remote::{LeaseToken, RemoteError};
use crate::session::VaultSession;
use crate::state::{StatePath, StatePayload};

/// Get, put and delete of a single secret in the session's vault
pub struct SecretStore {
    session: Arc<VaultSession>,
}

impl SecretStore {
    pub fn new(session: Arc<VaultSession>) -> Self {
        Self { session }
    }

    /// Fetch the newest version (or the pinned one)
    ///
    /// A secret that was never written, or holds no data, is `None`.
    pub async fn get(&self, path: &StatePath) -> BackendResult<Option<StatePayload>> {
        self.session.check_path(path)?;

        let result = self
            .session
            .data_plane()
            .get_secret(self.session.endpoint(), &path.secret, path.version.as_deref())
            .await;

        match result {
            Ok(Some(data)) if !data.is_empty() => {
                debug!("Read {} bytes of state from {}", data.len(), path);
                Ok(Some(StatePayload::new(data)))
            }
            Ok(_) | Err(RemoteError::NotFound(_)) => {
                debug!("No state stored at {}", path);
                Ok(None)
            }
            Err(err) => Err(BackendError::remote_read("read state", path, err)),
        }
    }

    /// Write the payload as a new secret version
    ///
    /// `lease` must be the live lease when the secret is locked.
    pub async fn put(
        &self,
        path: &StatePath,
        payload: &StatePayload,
        lease: Option<&LeaseToken>,
    ) -> BackendResult<()> {
        self.check_writable(path)?;

        self.session
            .data_plane()
            .set_secret(self.session.endpoint(), &path.secret, payload.as_bytes(), lease)
            .await
            .map_err(|e| BackendError::remote_write("write state", path, e))?;

        info!("Wrote {} bytes of state to {}", payload.len(), path);
        Ok(())
    }

    /// Delete the secret; deleting an absent secret succeeds
    pub async fn delete(&self, path: &StatePath, lease: Option<&LeaseToken>) -> BackendResult<()> {
        self.check_writable(path)?;

        let result = self
            .session
            .data_plane()
            .delete_secret(self.session.endpoint(), &path.secret, lease)
            .await;

        match result {
            Ok(()) => {
                info!("Deleted state at {}", path);
                Ok(())
            }
            Err(RemoteError::NotFound(_)) => {
                debug!("State at {} was already absent", path);
                Ok(())
            }
            Err(err) => Err(BackendError::remote_write("delete state", path, err)),
        }
    }

    fn check_writable(&self, path: &StatePath) -> BackendResult<()> {
        self.session.check_path(path)?;
        if path.version.is_some() {
            return Err(BackendError::configuration(format!(
                "Cannot modify pinned secret version {}",
                path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthFailure;
    use crate::remote::memory::{Fault, InMemoryVault};
    use crate::session::tests::open_session;

    #[tokio::test]
    async fn test_get_never_written() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());

        let state = store.get(&session.path("tfstate-prod")).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        let path = session.path("tfstate-prod");

        store.put(&path, &StatePayload::from("v1"), None).await.unwrap();
        store.put(&path, &StatePayload::from("v2"), None).await.unwrap();

        let state = store.get(&path).await.unwrap().unwrap();
        assert_eq!(state.as_bytes(), b"v2");
        assert_eq!(vault.secret_versions("tfstate-prod"), 2);
    }

    #[tokio::test]
    async fn test_get_pinned_version() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        let path = session.path("tfstate-prod");

        store.put(&path, &StatePayload::from("first"), None).await.unwrap();
        store.put(&path, &StatePayload::from("second"), None).await.unwrap();

        let first = store.get(&path.clone().with_version("1")).await.unwrap().unwrap();
        assert_eq!(first.as_bytes(), b"first");

        let result = store
            .put(&path.with_version("1"), &StatePayload::from("x"), None)
            .await;
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        let path = session.path("tfstate-prod");

        store.put(&path, &StatePayload::from("state"), None).await.unwrap();
        store.delete(&path, None).await.unwrap();
        assert!(store.get(&path).await.unwrap().is_none());

        // Deleting again is not an error
        store.delete(&path, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_failure_is_transient() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        vault.inject(Fault::GetSecret(RemoteError::Transport(
            "connection reset".to_string(),
        )));

        let error = store.get(&session.path("tfstate-prod")).await.unwrap_err();
        assert!(matches!(error, BackendError::Transient { .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_write_failure() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        vault.inject(Fault::SetSecret(RemoteError::Service {
            status: 500,
            message: "internal".to_string(),
        }));

        let error = store
            .put(&session.path("tfstate-prod"), &StatePayload::from("x"), None)
            .await
            .unwrap_err();
        match error {
            BackendError::Write { operation, path, .. } => {
                assert_eq!(operation, "write state");
                assert_eq!(path, "v1/tfstate-prod");
            }
            other => panic!("Expected Write error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_credential_is_auth_failure() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session.clone());
        let path = session.path("tfstate-prod");

        vault.inject(Fault::GetSecret(RemoteError::Unauthorized(
            "token expired".to_string(),
        )));
        let error = store.get(&path).await.unwrap_err();
        match &error {
            BackendError::Auth { reason, source, .. } => {
                assert_eq!(*reason, AuthFailure::TokenExchangeFailed);
                assert!(matches!(source, Some(RemoteError::Unauthorized(_))));
            }
            other => panic!("Expected Auth error, got {:?}", other),
        }
        assert!(!error.is_retryable());

        vault.inject(Fault::SetSecret(RemoteError::Unauthorized(
            "forbidden".to_string(),
        )));
        let error = store
            .put(&path, &StatePayload::from("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_path_outside_vault() {
        let vault = Arc::new(InMemoryVault::new());
        let session = open_session(&vault).await;
        let store = SecretStore::new(session);

        let result = store.get(&StatePath::new("other", "state")).await;
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }
}
