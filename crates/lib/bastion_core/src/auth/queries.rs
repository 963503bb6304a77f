//! Postgres-backed credential store, revocation ledger and audit writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::AuthError;
use super::audit::{AuditError, AuditRecord, AuditWriter};
use super::credentials::CredentialStore;
use super::ledger::RevocationLedger;
use crate::models::auth::{CredentialRecord, NewUser, RevocationEntry};
use crate::uuid::uuidv7;

type UserRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    bool,
    bool,
);

const USER_COLUMNS: &str = "id::text, username, email, password_hash, role, \
     first_name, last_name, enabled, locked, credentials_expired";

fn record_from_row(row: UserRow) -> CredentialRecord {
    let (
        id,
        username,
        email,
        password_hash,
        role,
        first_name,
        last_name,
        enabled,
        locked,
        credentials_expired,
    ) = row;
    CredentialRecord {
        id,
        username,
        email,
        password_hash,
        role,
        first_name,
        last_name,
        enabled,
        locked,
        credentials_expired,
    }
}

/// Credential store over the `users` and `role_permissions` tables.
#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1)"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError> {
        let Ok(id) = uuid::Uuid::parse_str(user_id) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    async fn create_user(&self, user: NewUser) -> Result<CredentialRecord, AuthError> {
        let result = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (id, username, email, password_hash, role, first_name, last_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(uuidv7())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.role)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(record_from_row(row)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                match db.constraint() {
                    Some("users_email_key") => Err(AuthError::EmailTaken),
                    _ => Err(AuthError::UsernameTaken),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, AuthError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT permission FROM role_permissions WHERE role = $1 ORDER BY permission",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Revocation ledger over the `revoked_tokens` table (primary key `jti`).
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevocationLedger for PgLedger {
    async fn claim(&self, entry: RevocationEntry) -> Result<bool, AuthError> {
        let result = sqlx::query(
            "INSERT INTO revoked_tokens (jti, subject, expires_at, revoked_at, reason) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (jti) DO NOTHING",
        )
        .bind(&entry.token_id)
        .bind(&entry.subject)
        .bind(entry.expires_at)
        .bind(entry.revoked_at)
        .bind(entry.reason.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM revoked_tokens WHERE jti = $1)",
        )
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Audit writer persisting to `auth_audit_log`.
#[derive(Debug, Clone)]
pub struct PgAuditWriter {
    pool: PgPool,
}

impl PgAuditWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditWriter for PgAuditWriter {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let details =
            serde_json::to_value(&record.event).map_err(|e| AuditError::Write(e.to_string()))?;
        sqlx::query(
            "INSERT INTO auth_audit_log (id, occurred_at, client, event_type, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(record.timestamp)
        .bind(&record.client)
        .bind(record.event.name())
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "PgAuditWriter"
    }
}
