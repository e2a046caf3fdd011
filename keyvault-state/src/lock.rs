//! Lock information for state backend locking

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::remote::Metadata;
use crate::state::StatePath;

/// Default lease duration in seconds (15 minutes)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 900;

/// Metadata key holding the serialized lock record. Must be lower case.
pub const LOCK_INFO_META_KEY: &str = "terraformlockid";

/// What a caller asks for when locking
///
/// Two identical descriptors describe the same request, so retrying a lock
/// with a clone of the descriptor is recognised as the same holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    /// Who requests the lock (username@hostname)
    pub who: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Free-form detail shown to other operators
    #[serde(default)]
    pub info: String,
    /// When the lock was requested
    pub created: DateTime<Utc>,
}

impl LockDescriptor {
    /// Create a descriptor for an operation, held by the current user
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            who: get_lock_owner(),
            operation: operation.into(),
            info: String::new(),
            created: Utc::now(),
        }
    }

    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }
}

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock, also used as the lease id
    pub id: String,
    /// The locked resource (vault/secret)
    pub path: String,
    /// The operation being performed
    pub operation: String,
    /// Who acquired the lock
    pub who: String,
    #[serde(default)]
    pub info: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock (and its lease) expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for a descriptor with a fresh id
    pub fn new(descriptor: &LockDescriptor, path: &StatePath, lease_duration: Duration) -> Self {
        let lifetime = TimeDelta::from_std(lease_duration)
            .unwrap_or_else(|_| TimeDelta::seconds(DEFAULT_LEASE_DURATION_SECS as i64));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            operation: descriptor.operation.clone(),
            who: descriptor.who.clone(),
            info: descriptor.info.clone(),
            created: descriptor.created,
            expires: Utc::now() + lifetime,
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> TimeDelta {
        self.expires - Utc::now()
    }

    /// Whether this lock was created from the given descriptor
    pub fn matches(&self, descriptor: &LockDescriptor) -> bool {
        self.who == descriptor.who
            && self.operation == descriptor.operation
            && self.info == descriptor.info
            && self.created == descriptor.created
    }

    /// Encode as a metadata value (base64 of the JSON record)
    pub fn to_metadata_value(&self) -> BackendResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| BackendError::InvalidLockInfo(format!("Failed to serialize lock: {}", e)))?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_metadata_value(raw: &str) -> BackendResult<Self> {
        let json = STANDARD
            .decode(raw.trim())
            .map_err(|e| BackendError::InvalidLockInfo(format!("Lock metadata is not base64: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| BackendError::InvalidLockInfo(format!("Failed to parse lock: {}", e)))
    }

    /// Extract the lock record from a metadata map, if present
    pub fn from_metadata(metadata: &Metadata) -> BackendResult<Option<Self>> {
        match metadata.get(LOCK_INFO_META_KEY) {
            Some(raw) if !raw.is_empty() => Self::from_metadata_value(raw).map(Some),
            _ => Ok(None),
        }
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> StatePath {
        StatePath::new("v1", "tfstate-prod")
    }

    #[test]
    fn test_lock_info_new() {
        let descriptor = LockDescriptor::new("apply").with_info("ci run 42");
        let lock = LockInfo::new(&descriptor, &path(), Duration::from_secs(60));
        assert_eq!(lock.operation, "apply");
        assert_eq!(lock.info, "ci run 42");
        assert_eq!(lock.path, "v1/tfstate-prod");
        assert!(!lock.id.is_empty());
        assert!(!lock.who.is_empty());
        assert!(lock.expires > lock.created);
        assert!(!lock.is_expired());
    }

    #[test]
    fn test_lock_ids_are_unique() {
        let descriptor = LockDescriptor::new("apply");
        let a = LockInfo::new(&descriptor, &path(), Duration::from_secs(60));
        let b = LockInfo::new(&descriptor, &path(), Duration::from_secs(60));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_lock_time_remaining() {
        let lock = LockInfo::new(&LockDescriptor::new("apply"), &path(), Duration::from_secs(60));
        let remaining = lock.time_remaining();
        // Should be close to 60 seconds (allowing for test execution time)
        assert!(remaining.num_seconds() > 55);
        assert!(remaining.num_seconds() <= 60);
    }

    #[test]
    fn test_lock_matches_descriptor() {
        let descriptor = LockDescriptor::new("apply").with_who("alice@host");
        let lock = LockInfo::new(&descriptor, &path(), Duration::from_secs(60));
        assert!(lock.matches(&descriptor));
        assert!(lock.matches(&descriptor.clone()));

        let other = LockDescriptor::new("apply").with_who("bob@host");
        assert!(!lock.matches(&other));

        let later = LockDescriptor {
            created: descriptor.created + TimeDelta::seconds(1),
            ..descriptor.clone()
        };
        assert!(!lock.matches(&later));
    }

    #[test]
    fn test_lock_owner_format() {
        let who = get_lock_owner();
        assert!(who.contains('@'));
    }

    #[test]
    fn test_lock_metadata_value() {
        let lock = LockInfo::new(&LockDescriptor::new("apply"), &path(), Duration::from_secs(60));
        let raw = lock.to_metadata_value().unwrap();
        assert!(!raw.contains('{'));

        let mut metadata = Metadata::new();
        assert!(LockInfo::from_metadata(&metadata).unwrap().is_none());

        metadata.insert(LOCK_INFO_META_KEY.to_string(), raw);
        let decoded = LockInfo::from_metadata(&metadata).unwrap().unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_corrupt_lock_metadata_is_reported() {
        let mut metadata = Metadata::new();
        metadata.insert(LOCK_INFO_META_KEY.to_string(), "not base64!".to_string());
        let result = LockInfo::from_metadata(&metadata);
        assert!(matches!(result, Err(BackendError::InvalidLockInfo(_))));
    }

    #[test]
    fn test_lock_metadata_key_matches_existing_records() {
        assert_eq!(LOCK_INFO_META_KEY, "terraformlockid");

        let lock = LockInfo::new(&LockDescriptor::new("apply"), &path(), Duration::from_secs(60));
        let mut metadata = Metadata::new();
        metadata.insert("terraformlockid".to_string(), lock.to_metadata_value().unwrap());
        assert_eq!(LockInfo::from_metadata(&metadata).unwrap(), Some(lock));
    }
}
