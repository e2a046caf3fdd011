//! Lease-based state locking
//!
//! A lock is two remote facts that are created and removed together: a
//! lease on the state secret, whose id is the lock id, and a [`LockInfo`]
//! record stored in the secret's metadata under [`LOCK_INFO_META_KEY`].
//! Exclusivity comes from the remote lease; the record tells other operators
//! who holds the lock and since when.
//!
//! Acquisition never leaves half a lock behind. Every failure after the
//! lease request (including cancellation of the `lock` future) undoes the
//! metadata write and releases the lease.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::backend::{BackendError, BackendResult};
use crate::lock::{LOCK_INFO_META_KEY, LockDescriptor, LockInfo};
use crate::remote::{LeaseToken, Metadata, RemoteError, VaultDataPlane, VaultEndpoint};
use crate::session::VaultSession;
use crate::state::StatePath;

/// Acquires and releases locks on secrets of one vault
pub struct LockCoordinator {
    session: Arc<VaultSession>,
    lease_duration: Duration,
    timeout: Duration,
}

impl LockCoordinator {
    /// `lease_duration` is the lifetime of a lock; `timeout` bounds each
    /// lock and unlock call
    pub fn new(session: Arc<VaultSession>, lease_duration: Duration, timeout: Duration) -> Self {
        Self {
            session,
            lease_duration,
            timeout,
        }
    }

    /// Lock `path` for the holder described by `descriptor`
    ///
    /// Locking again with an identical descriptor while its lock is held
    /// returns the existing lock.
    pub async fn lock(&self, path: &StatePath, descriptor: &LockDescriptor) -> BackendResult<LockInfo> {
        self.session.check_path(path)?;
        match tokio::time::timeout(self.timeout, self.acquire(path, descriptor)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout("lock", path, self.timeout)),
        }
    }

    /// Release the lock with id `lock_id`
    pub async fn unlock(&self, path: &StatePath, lock_id: &str) -> BackendResult<()> {
        self.session.check_path(path)?;
        match tokio::time::timeout(self.timeout, self.release(path, lock_id)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout("unlock", path, self.timeout)),
        }
    }

    /// The lock currently recorded on `path`
    pub async fn current_lock(&self, path: &StatePath) -> BackendResult<Option<LockInfo>> {
        self.session.check_path(path)?;
        let metadata = self.fetch_metadata(path).await?;
        LockInfo::from_metadata(&metadata)
    }

    async fn acquire(&self, path: &StatePath, descriptor: &LockDescriptor) -> BackendResult<LockInfo> {
        let mut metadata = self.fetch_metadata(path).await?;

        if let Some(existing) = LockInfo::from_metadata(&metadata)? {
            if !existing.is_expired() {
                if existing.matches(descriptor) {
                    info!(
                        "Lock {} on {} is already held by this request",
                        existing.id, path
                    );
                    return Ok(existing);
                }
                return Err(BackendError::locked(&existing));
            }
            // An expired record no longer has a lease behind it, even when it
            // was written for this same request
            warn!(
                "Taking over expired lock {} on {} held by {} since {}",
                existing.id, path, existing.who, existing.created
            );
        }

        let lock = LockInfo::new(descriptor, path, self.lease_duration);
        let encoded = lock.to_metadata_value()?;
        metadata.remove(LOCK_INFO_META_KEY);

        let data_plane = self.session.data_plane();
        let endpoint = self.session.endpoint();
        let mut pending = PendingLock {
            data_plane: Arc::clone(data_plane),
            endpoint: endpoint.clone(),
            secret: path.secret.clone(),
            lease: LeaseToken::new(&lock.id),
            restore: None,
            armed: true,
        };

        let result = data_plane
            .acquire_lease(endpoint, &path.secret, &pending.lease, self.lease_duration)
            .await;
        match result {
            Ok(lease) => pending.lease = lease,
            Err(RemoteError::LeaseConflict(_)) => {
                pending.disarm();
                return Err(self.conflict(path).await);
            }
            Err(err) => {
                // The lease may have been granted before the error surfaced
                pending.rollback().await;
                return Err(BackendError::remote_write("acquire lease", path, err));
            }
        }

        pending.restore = Some(metadata.clone());
        metadata.insert(LOCK_INFO_META_KEY.to_string(), encoded);

        if let Err(err) = data_plane
            .set_metadata(endpoint, &path.secret, &metadata, &pending.lease)
            .await
        {
            pending.rollback().await;
            return Err(BackendError::remote_write("write lock info", path, err));
        }

        pending.disarm();
        info!(
            "Acquired lock {} on {} for {} ({})",
            lock.id, path, lock.who, lock.operation
        );
        Ok(lock)
    }

    async fn release(&self, path: &StatePath, lock_id: &str) -> BackendResult<()> {
        let mut metadata = self.fetch_metadata(path).await?;

        let existing = LockInfo::from_metadata(&metadata)?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;
        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        metadata.remove(LOCK_INFO_META_KEY);
        let lease = LeaseToken::new(lock_id);
        let data_plane = self.session.data_plane();
        let endpoint = self.session.endpoint();

        match data_plane
            .set_metadata(endpoint, &path.secret, &metadata, &lease)
            .await
        {
            Ok(()) => {}
            Err(RemoteError::LeaseMismatch(_)) => {
                // The lease lapsed server-side; nobody else took it, since
                // the record still names us
                debug!("Lease {} on {} has lapsed, taking it again", lock_id, path);
                data_plane
                    .acquire_lease(endpoint, &path.secret, &lease, self.lease_duration)
                    .await
                    .map_err(|e| BackendError::remote_write("reacquire lease", path, e))?;
                data_plane
                    .set_metadata(endpoint, &path.secret, &metadata, &lease)
                    .await
                    .map_err(|e| BackendError::remote_write("clear lock info", path, e))?;
            }
            Err(err) => return Err(BackendError::remote_write("clear lock info", path, err)),
        }

        if let Err(err) = data_plane.release_lease(endpoint, &path.secret, &lease).await {
            warn!(
                "Lock {} on {} is released but its lease could not be ({}); it expires server-side",
                lock_id, path, err
            );
        }

        info!("Released lock {} on {}", lock_id, path);
        Ok(())
    }

    async fn fetch_metadata(&self, path: &StatePath) -> BackendResult<Metadata> {
        self.session
            .data_plane()
            .get_metadata(self.session.endpoint(), &path.secret)
            .await
            .map_err(|e| BackendError::remote_read("read lock info", path, e))
    }

    /// Describe the holder of a lease we lost the race for
    async fn conflict(&self, path: &StatePath) -> BackendError {
        match self.current_lock(path).await {
            Ok(Some(holder)) => BackendError::locked(&holder),
            Ok(None) => BackendError::LeaseHeld {
                path: path.to_string(),
            },
            Err(err) => {
                debug!("Could not read the lock holder of {}: {}", path, err);
                BackendError::LeaseHeld {
                    path: path.to_string(),
                }
            }
        }
    }
}

/// Undo log of an acquisition in progress
///
/// Dropped while armed (the `lock` future was cancelled or timed out), it
/// spawns the rollback on the current runtime.
struct PendingLock {
    data_plane: Arc<dyn VaultDataPlane>,
    endpoint: VaultEndpoint,
    secret: String,
    lease: LeaseToken,
    /// Metadata to put back once the lock record may have been written
    restore: Option<Metadata>,
    armed: bool,
}

impl PendingLock {
    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn rollback(&mut self) {
        self.armed = false;
        undo(
            Arc::clone(&self.data_plane),
            self.endpoint.clone(),
            self.secret.clone(),
            self.lease.clone(),
            self.restore.take(),
        )
        .await;
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Lock acquisition on {} was cancelled, rolling back", self.secret);
                handle.spawn(undo(
                    Arc::clone(&self.data_plane),
                    self.endpoint.clone(),
                    self.secret.clone(),
                    self.lease.clone(),
                    self.restore.take(),
                ));
            }
            Err(_) => warn!(
                "Lock acquisition on {} was cancelled outside a runtime; lease {} expires server-side",
                self.secret, self.lease
            ),
        }
    }
}

async fn undo(
    data_plane: Arc<dyn VaultDataPlane>,
    endpoint: VaultEndpoint,
    secret: String,
    lease: LeaseToken,
    restore: Option<Metadata>,
) {
    if let Some(metadata) = restore {
        if let Err(err) = data_plane
            .set_metadata(&endpoint, &secret, &metadata, &lease)
            .await
        {
            warn!("Failed to remove partial lock info from {}: {}", secret, err);
        }
    }

    if let Err(err) = data_plane.release_lease(&endpoint, &secret, &lease).await {
        debug!("Lease {} on {} not released during rollback: {}", lease, secret, err);
    }
}
