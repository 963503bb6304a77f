//! Audit sink: security-relevant outcomes recorded off the request path.
//!
//! Callers push records onto a bounded queue and never wait. When the queue
//! is full the newest record is dropped and counted. A single worker drains
//! the queue into an [`AuditWriter`]; writer failures are logged and
//! swallowed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::auth::RevocationReason;
use crate::uuid::uuidv7;

/// Tracing target used by [`TracingAuditWriter`].
pub const AUDIT_TARGET: &str = "bastion::audit";

/// Audit event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    LoginSucceeded {
        user_id: String,
        username: String,
    },
    /// `reason` is the internal error code; it is never sent to clients.
    LoginFailed {
        username: String,
        reason: String,
    },
    LoginThrottled {
        retry_after_secs: u64,
    },
    Registered {
        user_id: String,
        username: String,
    },
    RegistrationRejected {
        username: String,
        reason: String,
    },
    TokenRefreshed {
        user_id: String,
        old_token_id: String,
        new_token_id: String,
    },
    RefreshRejected {
        reason: String,
    },
    /// A refresh token was presented after it had already been rotated.
    RefreshReuseDetected {
        user_id: String,
        token_id: String,
    },
    TokenRevoked {
        user_id: String,
        token_id: String,
        reason: RevocationReason,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::LoginSucceeded { .. } => "login_succeeded",
            AuditEvent::LoginFailed { .. } => "login_failed",
            AuditEvent::LoginThrottled { .. } => "login_throttled",
            AuditEvent::Registered { .. } => "registered",
            AuditEvent::RegistrationRejected { .. } => "registration_rejected",
            AuditEvent::TokenRefreshed { .. } => "token_refreshed",
            AuditEvent::RefreshRejected { .. } => "refresh_rejected",
            AuditEvent::RefreshReuseDetected { .. } => "refresh_reuse_detected",
            AuditEvent::TokenRevoked { .. } => "token_revoked",
        }
    }
}

/// An event plus where and when it happened.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Client identity (derived address), if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(client: Option<String>, event: AuditEvent) -> Self {
        Self {
            id: uuidv7(),
            timestamp: Utc::now(),
            client,
            event,
        }
    }
}

/// Errors raised by audit writers. Never propagated to callers of the sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit write failed: {0}")]
    Write(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Write(e.to_string())
    }
}

/// Destination for drained audit records.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Writer identifier for logging.
    fn name(&self) -> &str;
}

/// Writes each record as a structured `info` event on [`AUDIT_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let payload =
            serde_json::to_string(record).map_err(|e| AuditError::Write(e.to_string()))?;
        info!(
            target: AUDIT_TARGET,
            event = record.event.name(),
            client = record.client.as_deref().unwrap_or("-"),
            record = %payload,
            "audit"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "TracingAuditWriter"
    }
}

/// Handle used by the auth path to record events. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Create the sink and spawn its worker. The worker exits once every
    /// sink clone has been dropped and the queue is drained.
    pub fn spawn(writer: Arc<dyn AuditWriter>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(rx, writer));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Enqueue an event without waiting.
    pub fn record(&self, client: Option<&str>, event: AuditEvent) {
        let record = AuditRecord::new(client.map(str::to_string), event);
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event = record.event.name(),
                    dropped_total = total,
                    "audit queue full, dropping record"
                );
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = record.event.name(),
                    "audit worker gone, dropping record"
                );
            }
        }
    }

    /// Records dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain(mut rx: mpsc::Receiver<AuditRecord>, writer: Arc<dyn AuditWriter>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = writer.write(&record).await {
            warn!(
                writer = writer.name(),
                event = record.event.name(),
                "failed to record audit event: {e}"
            );
        }
    }
    debug!(writer = writer.name(), "audit worker stopped");
}
