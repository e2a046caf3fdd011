//! State payload and its location in the vault

use std::fmt;

/// The serialized state snapshot, opaque to this crate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePayload {
    data: Vec<u8>,
}

impl StatePayload {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for StatePayload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&str> for StatePayload {
    fn from(data: &str) -> Self {
        Self::new(data.as_bytes())
    }
}

/// Location of a state payload: vault, secret name and optional version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath {
    pub vault: String,
    pub secret: String,
    /// Pinned version; `None` addresses the latest
    pub version: Option<String>,
}

impl StatePath {
    pub fn new(vault: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            vault: vault.into(),
            secret: secret.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}/{}/{}", self.vault, self.secret, version),
            None => write!(f, "{}/{}", self.vault, self.secret),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_path_display() {
        let path = StatePath::new("v1", "tfstate-prod");
        assert_eq!(path.to_string(), "v1/tfstate-prod");

        let pinned = path.with_version("abc123");
        assert_eq!(pinned.to_string(), "v1/tfstate-prod/abc123");
    }

    #[test]
    fn test_payload_bytes() {
        let payload = StatePayload::from("{\"serial\":1}");
        assert_eq!(payload.len(), 12);
        assert!(!payload.is_empty());
        assert_eq!(payload.clone().into_bytes(), payload.as_bytes().to_vec());
        assert!(StatePayload::default().is_empty());
    }
}
