//! Role → permission resolution with a short-lived cache.
//!
//! The cache is keyed by role name and lives outside any user record, so
//! nothing has to invalidate it when an entity changes. Entries simply age
//! out after the configured TTL.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::AuthError;
use super::credentials::CredentialStore;

/// A cached permission set with expiry.
#[derive(Debug, Clone)]
struct CacheEntry {
    permissions: Arc<BTreeSet<String>>,
    expires_at: Instant,
}

/// Resolves the permission set of a role, consulting the credential store at
/// most once per role per TTL.
pub struct PermissionResolver {
    store: Arc<dyn CredentialStore>,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Permission names for `role`, from cache when fresh.
    pub async fn resolve(&self, role: &str) -> Result<Arc<BTreeSet<String>>, AuthError> {
        if let Some(hit) = self.cached(role, Instant::now()) {
            return Ok(hit);
        }
        let permissions: Arc<BTreeSet<String>> =
            Arc::new(self.store.role_permissions(role).await?.into_iter().collect());
        self.entries.insert(
            role.to_string(),
            CacheEntry {
                permissions: Arc::clone(&permissions),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(permissions)
    }

    fn cached(&self, role: &str, now: Instant) -> Option<Arc<BTreeSet<String>>> {
        self.entries.get(role).and_then(|entry| {
            if now < entry.expires_at {
                Some(Arc::clone(&entry.permissions))
            } else {
                None
            }
        })
    }

    /// Drop the cached set for one role.
    pub fn invalidate(&self, role: &str) {
        self.entries.remove(role);
    }

    /// Remove all entries from the cache.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::models::auth::{CredentialRecord, NewUser};

    /// Store that counts role lookups.
    #[derive(Default)]
    struct CountingRoles {
        lookups: AtomicU32,
    }

    #[async_trait]
    impl CredentialStore for CountingRoles {
        async fn find_by_username(
            &self,
            _username: &str,
        ) -> Result<Option<CredentialRecord>, AuthError> {
            Ok(None)
        }

        async fn find_by_id(&self, _user_id: &str) -> Result<Option<CredentialRecord>, AuthError> {
            Ok(None)
        }

        async fn create_user(&self, _user: NewUser) -> Result<CredentialRecord, AuthError> {
            Err(AuthError::Internal("unsupported".into()))
        }

        async fn role_permissions(&self, role: &str) -> Result<Vec<String>, AuthError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(vec![format!("{role}:read")])
        }
    }

    #[tokio::test]
    async fn second_resolve_hits_cache() {
        let store = Arc::new(CountingRoles::default());
        let resolver = PermissionResolver::new(store.clone(), Duration::from_secs(60));
        let first = resolver.resolve("user").await.unwrap();
        let second = resolver.resolve("user").await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("user:read"));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let store = Arc::new(CountingRoles::default());
        let resolver = PermissionResolver::new(store.clone(), Duration::ZERO);
        resolver.resolve("user").await.unwrap();
        resolver.resolve("user").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let store = Arc::new(CountingRoles::default());
        let resolver = PermissionResolver::new(store.clone(), Duration::from_secs(60));
        resolver.resolve("admin").await.unwrap();
        resolver.invalidate("admin");
        resolver.resolve("admin").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }
}
