//! Credential store contract and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::AuthError;
use crate::models::auth::{CredentialRecord, NewUser};

/// Permissions granted to the built-in roles of the in-memory store.
pub const DEFAULT_ROLE_PERMISSIONS: &[(&str, &[&str])] = &[
    ("user", &["profile:read", "profile:write"]),
    (
        "admin",
        &["profile:read", "profile:write", "users:read", "tokens:revoke"],
    ),
];

/// User identity, password hash, role and account-state flags.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str)
    -> Result<Option<CredentialRecord>, AuthError>;

    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError>;

    /// Create a user. Fails with `UsernameTaken` or `EmailTaken`.
    async fn create_user(&self, user: NewUser) -> Result<CredentialRecord, AuthError>;

    /// Permission names granted to a role. Unknown roles have none.
    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, AuthError>;
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, CredentialRecord>,
    /// Lowercased username → user ID.
    by_username: HashMap<String, String>,
    /// Lowercased email → user ID.
    by_email: HashMap<String, String>,
    roles: HashMap<String, Vec<String>>,
}

/// In-process credential store, used in development mode and tests.
#[derive(Debug)]
pub struct MemoryCredentialStore {
    inner: RwLock<Inner>,
}

impl MemoryCredentialStore {
    /// Empty store with the default role table.
    pub fn new() -> Self {
        let roles = DEFAULT_ROLE_PERMISSIONS
            .iter()
            .map(|(role, perms)| {
                (
                    role.to_string(),
                    perms.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect();
        Self {
            inner: RwLock::new(Inner {
                roles,
                ..Inner::default()
            }),
        }
    }

    /// Replace the permission set of a role.
    pub async fn set_role_permissions(&self, role: &str, permissions: Vec<String>) {
        self.inner
            .write()
            .await
            .roles
            .insert(role.to_string(), permissions);
    }

    /// Apply `f` to a stored record. Returns false if the user is unknown.
    pub async fn update_user<F>(&self, user_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CredentialRecord),
    {
        match self.inner.write().await.users.get_mut(user_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub async fn user_count(&self) -> usize {
        self.inner.read().await.users.len()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, AuthError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_username
            .get(&username.to_lowercase())
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<CredentialRecord, AuthError> {
        let mut inner = self.inner.write().await;
        let username_key = user.username.to_lowercase();
        let email_key = user.email.to_lowercase();
        if inner.by_username.contains_key(&username_key) {
            return Err(AuthError::UsernameTaken);
        }
        if inner.by_email.contains_key(&email_key) {
            return Err(AuthError::EmailTaken);
        }

        let record = CredentialRecord {
            id: crate::uuid::uuidv7().to_string(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            role: user.role,
            first_name: user.first_name,
            last_name: user.last_name,
            enabled: true,
            locked: false,
            credentials_expired: false,
        };
        inner.by_username.insert(username_key, record.id.clone());
        inner.by_email.insert(email_key, record.id.clone());
        inner.users.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, AuthError> {
        Ok(self
            .inner
            .read()
            .await
            .roles
            .get(role)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            role: "user".to_string(),
            first_name: None,
            last_name: None,
        }
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = MemoryCredentialStore::new();
        let created = store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();
        let by_name = store.find_by_username("Alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        let by_id = store.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
        assert!(by_id.is_active());
    }

    #[tokio::test]
    async fn duplicate_username_and_email_are_rejected() {
        let store = MemoryCredentialStore::new();
        store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();
        assert!(matches!(
            store
                .create_user(new_user("ALICE", "other@example.com"))
                .await,
            Err(AuthError::UsernameTaken)
        ));
        assert!(matches!(
            store
                .create_user(new_user("alice2", "Alice@Example.com"))
                .await,
            Err(AuthError::EmailTaken)
        ));
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn default_roles_have_permissions() {
        let store = MemoryCredentialStore::new();
        let perms = store.role_permissions("admin").await.unwrap();
        assert!(perms.contains(&"tokens:revoke".to_string()));
        assert!(store.role_permissions("ghost").await.unwrap().is_empty());
    }
}
