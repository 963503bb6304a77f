//! Authentication domain models.
//!
//! These are internal domain models, distinct from the HTTP request and
//! response bodies in `bastion_api::models` (which use camelCase).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a signed token. Checked at every validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT claims signed into every token.
///
/// Refresh tokens only carry the registered claims plus `type`; the identity
/// fields are `None` and omitted from the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Token identifier, unique per issuance.
    pub jti: String,
    /// Subject (user ID).
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub iss: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl TokenClaims {
    /// Expiry as a UTC instant. Falls back to the epoch for out-of-range values.
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

/// Denormalized identity fields carried by access tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub username: String,
    pub email: Option<String>,
}

/// Authenticated identity and permission snapshot, computed once when a
/// token is validated and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub permissions: BTreeSet<String>,
    /// Identifier of the token this principal was derived from.
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Why a token identifier was entered in the revocation ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevocationReason {
    Logout,
    PasswordChange,
    AdminRevoke,
    SecurityBreach,
    SessionExpired,
    Rotated,
}

impl RevocationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevocationReason::Logout => "LOGOUT",
            RevocationReason::PasswordChange => "PASSWORD_CHANGE",
            RevocationReason::AdminRevoke => "ADMIN_REVOKE",
            RevocationReason::SecurityBreach => "SECURITY_BREACH",
            RevocationReason::SessionExpired => "SESSION_EXPIRED",
            RevocationReason::Rotated => "ROTATED",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGOUT" => Ok(RevocationReason::Logout),
            "PASSWORD_CHANGE" => Ok(RevocationReason::PasswordChange),
            "ADMIN_REVOKE" => Ok(RevocationReason::AdminRevoke),
            "SECURITY_BREACH" => Ok(RevocationReason::SecurityBreach),
            "SESSION_EXPIRED" => Ok(RevocationReason::SessionExpired),
            "ROTATED" => Ok(RevocationReason::Rotated),
            other => Err(format!("unknown revocation reason '{other}'")),
        }
    }
}

/// Ledger row. Never mutated; removed by the sweep once `expires_at` passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub token_id: String,
    pub subject: String,
    /// Natural expiry of the revoked token.
    pub expires_at: DateTime<Utc>,
    pub revoked_at: DateTime<Utc>,
    pub reason: RevocationReason,
}

impl RevocationEntry {
    /// Build an entry for the given claims, revoked now.
    pub fn for_claims(claims: &TokenClaims, reason: RevocationReason) -> Self {
        Self {
            token_id: claims.jti.clone(),
            subject: claims.sub.clone(),
            expires_at: claims.expires_at(),
            revoked_at: Utc::now(),
            reason,
        }
    }
}

/// User credential record as held by the credential store.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub locked: bool,
    pub credentials_expired: bool,
}

impl CredentialRecord {
    /// True when no account-state flag forbids authentication.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.locked && !self.credentials_expired
    }
}

/// Input for creating a user. `password_hash` is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Registration input as received from the caller (plaintext password).
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Identity snapshot returned alongside a token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub permissions: BTreeSet<String>,
}

/// Freshly issued token pair plus identity info.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub access_expires_at: DateTime<Utc>,
    pub user: UserInfo,
}
