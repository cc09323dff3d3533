//! In-memory management backend.
//!
//! Full user and key management over process-local maps, with Argon2id
//! password hashes. This is the development and testing counterpart of a
//! real database backend; it makes the portal work out of the box and
//! disappears with the process.

use crate::{
    error::GatewayError,
    plugin::{BackendPlugin, Extension, ManagementPlugin, PluginBuild, PluginConfig},
    types::{Key, User},
};
use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone)]
struct UserRecord {
    user: User,
    password_hash: String,
}

#[derive(Default)]
pub struct MemoryBackend {
    users: DashMap<String, UserRecord>,
    keys: DashMap<String, Key>,
}

fn hash_password(password: &str) -> Result<String, GatewayError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GatewayError::Internal(anyhow!("password hashing failed: {e}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
        .unwrap_or(false)
}

impl PluginBuild for MemoryBackend {
    fn configure(&mut self, _config: PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }

    fn into_extension(self: Box<Self>) -> Extension {
        let shared = Arc::new(*self);
        Extension::new().with_backend(shared.clone()).with_management(shared)
    }
}

#[async_trait]
impl BackendPlugin for MemoryBackend {
    async fn get_key(&self, key_id: &str, key_type: &str) -> Result<Option<Key>, GatewayError> {
        Ok(self
            .keys
            .get(key_id)
            .filter(|key| key.key_type == key_type)
            .map(|key| key.value().clone()))
    }
}

#[async_trait]
impl ManagementPlugin for MemoryBackend {
    async fn add_user(
        &self,
        email: &str,
        password: &str,
        mut user: User,
    ) -> Result<User, GatewayError> {
        let email = email.to_lowercase();
        if self.users.contains_key(&email) {
            return Err(GatewayError::abort(400, "an account with this address already exists"));
        }
        user.email = email.clone();
        let record = UserRecord { user: user.clone(), password_hash: hash_password(password)? };
        self.users.insert(email, record);
        Ok(user)
    }

    async fn get_user(&self, email: &str) -> Result<Option<User>, GatewayError> {
        Ok(self.users.get(&email.to_lowercase()).map(|record| record.user.clone()))
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, GatewayError> {
        Ok(self
            .users
            .get(&email.to_lowercase())
            .filter(|record| verify_password(password, &record.password_hash))
            .map(|record| record.user.clone()))
    }

    async fn activate_user(&self, email: &str) -> Result<(), GatewayError> {
        let mut record = self
            .users
            .get_mut(&email.to_lowercase())
            .ok_or_else(|| GatewayError::Internal(anyhow!("no account for '{email}'")))?;
        record.user.active = true;
        Ok(())
    }

    async fn reset_password(&self, email: &str, new_password: &str) -> Result<(), GatewayError> {
        let hash = hash_password(new_password)?;
        let mut record = self
            .users
            .get_mut(&email.to_lowercase())
            .ok_or_else(|| GatewayError::Internal(anyhow!("no account for '{email}'")))?;
        record.password_hash = hash;
        Ok(())
    }

    async fn update_user(&self, email: &str, user: &User) -> Result<(), GatewayError> {
        let mut record = self
            .users
            .get_mut(&email.to_lowercase())
            .ok_or_else(|| GatewayError::Internal(anyhow!("no account for '{email}'")))?;
        // Email and password stay as stored.
        record.user.name = user.name.clone();
        record.user.profile = user.profile.clone();
        Ok(())
    }

    async fn add_key(&self, email: &str, key: &Key) -> Result<(), GatewayError> {
        let mut key = key.clone();
        key.owner = email.to_lowercase();
        self.keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn delete_key(&self, email: &str, key_id: &str) -> Result<(), GatewayError> {
        let email = email.to_lowercase();
        let owned = self
            .keys
            .get(key_id)
            .map(|key| key.owner == email)
            .unwrap_or(false);
        if !owned {
            return Err(GatewayError::abort(404, "no such key"));
        }
        self.keys.remove(key_id);
        Ok(())
    }

    async fn get_all_keys(&self, email: &str) -> Result<Vec<Key>, GatewayError> {
        let email = email.to_lowercase();
        Ok(self
            .keys
            .iter()
            .filter(|entry| entry.owner == email)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn backend() -> MemoryBackend {
        MemoryBackend::default()
    }

    fn new_user(email: &str) -> User {
        User { email: email.into(), name: "Test User".into(), active: false, profile: Map::new() }
    }

    fn hmac_key(id: &str) -> Key {
        Key { id: id.into(), key_type: "HMAC".into(), quota: "default".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let backend = backend();

        let stored = backend
            .add_user("Dev@Example.com", "hunter2", new_user("Dev@Example.com"))
            .await
            .unwrap();
        assert_eq!(stored.email, "dev@example.com");
        assert!(!stored.active);

        // Wrong password and inactive state are both visible to callers.
        assert!(backend.authenticate("dev@example.com", "wrong").await.unwrap().is_none());
        let user = backend.authenticate("dev@example.com", "hunter2").await.unwrap().unwrap();
        assert!(!user.active);

        backend.activate_user("dev@example.com").await.unwrap();
        let user = backend.authenticate("dev@example.com", "hunter2").await.unwrap().unwrap();
        assert!(user.active);
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let backend = backend();
        backend.add_user("dev@example.com", "pw", new_user("dev@example.com")).await.unwrap();

        let err = backend
            .add_user("DEV@example.com", "pw", new_user("dev@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_password_reset() {
        let backend = backend();
        backend.add_user("dev@example.com", "old", new_user("dev@example.com")).await.unwrap();

        backend.reset_password("dev@example.com", "new").await.unwrap();
        assert!(backend.authenticate("dev@example.com", "old").await.unwrap().is_none());
        assert!(backend.authenticate("dev@example.com", "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_preserves_email() {
        let backend = backend();
        backend.add_user("dev@example.com", "pw", new_user("dev@example.com")).await.unwrap();

        let mut update = new_user("evil@example.com");
        update.name = "Renamed".into();
        update.profile.insert("team".into(), "api".into());
        backend.update_user("dev@example.com", &update).await.unwrap();

        let user = backend.get_user("dev@example.com").await.unwrap().unwrap();
        assert_eq!(user.email, "dev@example.com");
        assert_eq!(user.name, "Renamed");
        assert_eq!(user.profile["team"], "api");
    }

    #[tokio::test]
    async fn test_key_storage_scoped_by_owner_and_type() {
        let backend = backend();
        backend.add_user("a@example.com", "pw", new_user("a@example.com")).await.unwrap();

        backend.add_key("a@example.com", &hmac_key("K1")).await.unwrap();
        backend.add_key("b@example.com", &hmac_key("K2")).await.unwrap();

        // Lookup by id and type, as the authenticator does.
        let key = backend.get_key("K1", "HMAC").await.unwrap().unwrap();
        assert_eq!(key.owner, "a@example.com");
        assert!(backend.get_key("K1", "OAuth2").await.unwrap().is_none());
        assert!(backend.get_key("K9", "HMAC").await.unwrap().is_none());

        let keys = backend.get_all_keys("a@example.com").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "K1");
    }

    #[tokio::test]
    async fn test_delete_key_requires_ownership() {
        let backend = backend();
        backend.add_key("a@example.com", &hmac_key("K1")).await.unwrap();

        let err = backend.delete_key("b@example.com", "K1").await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert!(backend.get_key("K1", "HMAC").await.unwrap().is_some());

        backend.delete_key("a@example.com", "K1").await.unwrap();
        assert!(backend.get_key("K1", "HMAC").await.unwrap().is_none());
    }
}
