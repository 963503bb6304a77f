//! Revocation ledger: the set of token identifiers that must be rejected
//! before their natural expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AuthError;
use crate::models::auth::RevocationEntry;

/// Storage contract for revoked token identifiers.
///
/// Implementations must tolerate concurrent `claim`, `is_revoked` and
/// `sweep_expired` calls.
#[async_trait]
pub trait RevocationLedger: Send + Sync {
    /// Insert the entry unless its token identifier is already present.
    /// Returns `true` when this call inserted it. This is the serialization
    /// point for refresh rotation.
    async fn claim(&self, entry: RevocationEntry) -> Result<bool, AuthError>;

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError>;

    /// Remove every entry whose recorded expiry is before `now`.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;

    /// Idempotent revoke. A duplicate is not an error.
    async fn revoke(&self, entry: RevocationEntry) -> Result<(), AuthError> {
        let token_id = entry.token_id.clone();
        let reason = entry.reason;
        if !self.claim(entry).await? {
            debug!(token_id = %token_id, reason = %reason, "token already revoked");
        }
        Ok(())
    }
}

/// In-process ledger backed by a sharded concurrent map.
///
/// Lookups only take a shard read lock. The sweep scans with read locks and
/// then removes keys one at a time, so it never holds a shard for the
/// length of a full pass.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: DashMap<String, RevocationEntry>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, token_id: &str) -> Option<RevocationEntry> {
        self.entries.get(token_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl RevocationLedger for MemoryLedger {
    async fn claim(&self, entry: RevocationEntry) -> Result<bool, AuthError> {
        match self.entries.entry(entry.token_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        Ok(self.entries.contains_key(token_id))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at < now)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for token_id in dead {
            if self
                .entries
                .remove_if(&token_id, |_, e| e.expires_at < now)
                .is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Spawn the periodic sweep. Stops when `shutdown` is cancelled.
pub fn spawn_sweeper(
    ledger: Arc<dyn RevocationLedger>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("ledger sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    match ledger.sweep_expired(Utc::now()).await {
                        Ok(0) => debug!("ledger sweep: nothing to remove"),
                        Ok(removed) => info!(removed, "ledger sweep removed expired entries"),
                        Err(e) => warn!("ledger sweep failed: {e}"),
                    }
                }
            }
        }
    })
}
