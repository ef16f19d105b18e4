//! In-memory identity directory

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use turnstile_common::config::UserSeedConfig;
use turnstile_common::now_millis;

use crate::error::StoreError;
use crate::status::IdentityStore;

/// A directory identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    /// Raw status value, as a directory would store it
    pub status: String,
    /// Hex SHA-256 of the password
    #[serde(skip_serializing)]
    pub password_sha256: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: "Active".to_string(),
            password_sha256: None,
            created_at: now_millis(),
        }
    }
}

/// Hex SHA-256 digest used for stored passwords
#[must_use]
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// In-memory identity store
///
/// Stands in for an external directory in tests and in the CLI.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, Identity>>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from configured seed identities
    pub fn from_seed(seed: &[UserSeedConfig]) -> Self {
        let store = Self::new();
        {
            let mut identities = store.identities.write();
            for user in seed {
                identities.insert(
                    user.id.clone(),
                    Identity {
                        id: user.id.clone(),
                        status: user.status.clone(),
                        password_sha256: user.password_sha256.as_ref().map(|d| d.to_lowercase()),
                        created_at: now_millis(),
                    },
                );
            }
        }
        store
    }

    // =========== Identity Operations ===========

    /// Create an active identity with a password
    pub fn create_identity(&self, id: &str, password: &str) -> Result<Identity, StoreError> {
        let mut identities = self.identities.write();
        if identities.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let mut identity = Identity::new(id);
        identity.password_sha256 = Some(password_digest(password));
        identities.insert(id.to_string(), identity.clone());
        Ok(identity)
    }

    pub fn get(&self, id: &str) -> Result<Identity, StoreError> {
        self.identities
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Set the raw status value
    pub fn set_status(&self, id: &str, status: &str) -> Result<(), StoreError> {
        let mut identities = self.identities.write();
        let identity = identities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        identity.status = status.to_string();
        Ok(())
    }

    /// Delete identity (marks as deleted, doesn't remove)
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.set_status(id, "Deleted")
    }

    pub fn set_password(&self, id: &str, password: &str) -> Result<(), StoreError> {
        let mut identities = self.identities.write();
        let identity = identities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        identity.password_sha256 = Some(password_digest(password));
        Ok(())
    }

    /// Check a password. Unknown identities and identities without a
    /// password never verify.
    pub fn verify_password(&self, id: &str, password: &str) -> Result<bool, StoreError> {
        let identities = self.identities.read();
        let Some(expected) = identities.get(id).and_then(|i| i.password_sha256.as_deref()) else {
            return Ok(false);
        };
        Ok(expected == password_digest(password))
    }

    pub fn list(&self) -> Vec<Identity> {
        let mut list: Vec<_> = self.identities.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn raw_status(&self, identity: &str) -> Result<String, StoreError> {
        self.get(identity).map(|i| i.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_verify() {
        let store = MemoryIdentityStore::new();
        store.create_identity("alice", "s3cret").unwrap();
        assert!(store.verify_password("alice", "s3cret").unwrap());
        assert!(!store.verify_password("alice", "wrong").unwrap());
        assert!(!store.verify_password("bob", "s3cret").unwrap());
        assert!(matches!(
            store.create_identity("alice", "x"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_marks_status() {
        let store = MemoryIdentityStore::new();
        store.create_identity("alice", "pw").unwrap();
        store.delete("alice").unwrap();
        assert_eq!(store.get("alice").unwrap().status, "Deleted");
        assert!(store.set_status("bob", "Active").is_err());
    }

    #[test]
    fn test_from_seed() {
        let store = MemoryIdentityStore::from_seed(&[UserSeedConfig {
            id: "demo".into(),
            status: "Inactive".into(),
            password_sha256: Some(password_digest("demo").to_uppercase()),
        }]);
        assert_eq!(store.get("demo").unwrap().status, "Inactive");
        assert!(store.verify_password("demo", "demo").unwrap());
    }

    #[tokio::test]
    async fn test_raw_status() {
        let store = MemoryIdentityStore::new();
        store.create_identity("alice", "pw").unwrap();
        assert_eq!(store.raw_status("alice").await.unwrap(), "Active");
        assert!(matches!(
            store.raw_status("nobody").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
