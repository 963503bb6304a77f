//! Request and response bodies.

use bastion_core::models::auth::{AuthSession, Registration, UserInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl From<RegisterRequest> for Registration {
    fn from(r: RegisterRequest) -> Self {
        Registration {
            username: r.username,
            password: r.password,
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Optional body of `POST /auth/logout`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    /// Refresh token of the session, revoked along with the bearer token.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Body of `POST /auth/revoke`.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
    /// Ledger reason name, e.g. `ADMIN_REVOKE` (the default).
    #[serde(default)]
    pub reason: Option<String>,
}

/// Token pair plus identity info.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

impl From<AuthSession> for TokenResponse {
    fn from(s: AuthSession) -> Self {
        Self {
            access_token: s.access_token,
            refresh_token: s.refresh_token,
            token_type: "Bearer".into(),
            expires_in: s.expires_in,
            expires_at: s.access_expires_at,
            user: s.user,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
