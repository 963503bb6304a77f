//! Authentication and session credential logic.
//!
//! Token issuance and validation, the revocation ledger, the login rate
//! limiter, password hashing and the audit sink. Shared by `bastion_api`
//! and the server binary.

pub mod audit;
pub mod credentials;
pub mod jwt;
pub mod keys;
pub mod ledger;
pub mod password;
pub mod permissions;
pub mod queries;
pub mod rate_limit;
pub mod service;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::ConfigError;

/// Authentication errors.
///
/// Variants are distinguished internally for audit logging; the HTTP layer
/// collapses credential and token failures into uniform messages.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Email already taken")]
    EmailTaken,

    #[error("Malformed token")]
    MalformedToken,

    #[error("Token signature invalid")]
    SignatureInvalid,

    #[error("Wrong token kind")]
    WrongTokenKind,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("User not found")]
    UserNotFound,

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { limit: u32, retry_after: Duration },

    #[error("Upstream store unavailable: {0}")]
    UpstreamStoreUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Only store outages are worth retrying; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::UpstreamStoreUnavailable(_))
    }

    /// True for failures of a presented token.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            AuthError::MalformedToken
                | AuthError::SignatureInvalid
                | AuthError::WrongTokenKind
                | AuthError::TokenExpired
                | AuthError::TokenRevoked
                | AuthError::UserNotFound
        )
    }

    /// Stable short code used in audit records.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountDisabled => "account_disabled",
            AuthError::UsernameTaken => "username_taken",
            AuthError::EmailTaken => "email_taken",
            AuthError::MalformedToken => "malformed_token",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::WrongTokenKind => "wrong_token_kind",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenRevoked => "token_revoked",
            AuthError::UserNotFound => "user_not_found",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::UpstreamStoreUnavailable(_) => "upstream_store_unavailable",
            AuthError::Validation(_) => "validation_error",
            AuthError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        AuthError::UpstreamStoreUnavailable(e.to_string())
    }
}

impl From<ConfigError> for AuthError {
    fn from(e: ConfigError) -> Self {
        AuthError::Internal(format!("configuration: {e}"))
    }
}

/// Run a store call under a deadline. An elapsed deadline is a store
/// failure, never a silent "not found".
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    what: &'static str,
    fut: F,
) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation = what, timeout_ms = limit.as_millis() as u64, "store call timed out");
            Err(AuthError::UpstreamStoreUnavailable(format!(
                "{what} timed out"
            )))
        }
    }
}
