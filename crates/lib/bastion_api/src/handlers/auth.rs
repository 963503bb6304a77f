//! Authentication request handlers.
//!
//! Every call into the auth service runs through [`run_detached`] so a
//! dropped connection cannot abandon a rotation or revocation half-way.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bastion_core::auth::AuthError;
use bastion_core::auth::audit::AuditEvent;
use bastion_core::auth::service::RequestContext;
use bastion_core::models::auth::{Principal, RevocationReason};
use tracing::info;

use super::run_detached;
use crate::AppState;
use crate::error::{
    AppError, AppResult, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, retry_after_secs,
};
use crate::middleware::auth::{AuthenticatedUser, BearerToken};
use crate::middleware::client_ip::ClientIdentity;
use crate::models::{
    LoginRequest, LogoutRequest, RefreshRequest, RegisterRequest, RevokeRequest, TokenResponse,
};

/// Permission required by `POST /auth/revoke`.
pub const REVOKE_PERMISSION: &str = "tokens:revoke";

fn rate_limit_headers(limit: u32, remaining: u32) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    headers
}

/// `POST /auth/login`: authenticate with username + password.
///
/// Throttled per client identity. Only bad credentials count against the
/// budget; a successful login clears it.
pub async fn login_handler(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Json(body): Json<LoginRequest>,
) -> AppResult<Response> {
    let limit = state.rate_limiter.max_attempts();
    let remaining = match state.rate_limiter.admit(&client).into_result() {
        Ok(remaining) => remaining,
        Err(e) => {
            if let AuthError::RateLimited { retry_after, .. } = &e {
                info!(client = %client, "login throttled");
                state.auth.audit().record(
                    Some(&client),
                    AuditEvent::LoginThrottled {
                        retry_after_secs: retry_after_secs(*retry_after),
                    },
                );
            }
            return Err(e.into());
        }
    };

    let auth = Arc::clone(&state.auth);
    let ctx = RequestContext::from_client(client.clone());
    let result = run_detached(async move {
        auth.login(&ctx, &body.username, &body.password).await
    })
    .await;

    match result {
        Ok(session) => {
            let remaining = state.rate_limiter.record_outcome(&client, true);
            Ok((
                rate_limit_headers(limit, remaining),
                Json(TokenResponse::from(session)),
            )
                .into_response())
        }
        Err(e @ (AuthError::InvalidCredentials | AuthError::AccountDisabled)) => {
            let remaining = state.rate_limiter.record_outcome(&client, false);
            Ok((rate_limit_headers(limit, remaining), AppError::from(e)).into_response())
        }
        // Not counted against the budget.
        Err(e) => Ok((rate_limit_headers(limit, remaining), AppError::from(e)).into_response()),
    }
}

/// `POST /auth/register`: create an account and log it in.
pub async fn register_handler(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Json(body): Json<RegisterRequest>,
) -> AppResult<Json<TokenResponse>> {
    let auth = Arc::clone(&state.auth);
    let ctx = RequestContext::from_client(client);
    let session = run_detached(async move { auth.register(&ctx, body.into()).await }).await?;
    Ok(Json(session.into()))
}

/// `POST /auth/refresh`: exchange a refresh token for a new pair. The
/// presented token is single-use.
pub async fn refresh_handler(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let auth = Arc::clone(&state.auth);
    let ctx = RequestContext::from_client(client);
    let session =
        run_detached(async move { auth.refresh(&ctx, &body.refresh_token).await }).await?;
    Ok(Json(session.into()))
}

/// `POST /auth/logout`: revoke the bearer access token and, when the body
/// carries one, the session's refresh token.
pub async fn logout_handler(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Extension(BearerToken(token)): Extension<BearerToken>,
    body: Option<Json<LogoutRequest>>,
) -> AppResult<StatusCode> {
    let refresh_token = body.and_then(|Json(body)| body.refresh_token);
    let auth = Arc::clone(&state.auth);
    let ctx = RequestContext::from_client(client);
    run_detached(async move {
        auth.logout(&ctx, &token, refresh_token.as_deref()).await
    })
    .await
    .map_err(|e| match e {
        e if e.is_token_error() => {
            AppError::Validation("Refresh token is not valid for this session".into())
        }
        e => e.into(),
    })?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /auth/me`: the authenticated principal.
pub async fn me_handler(
    Extension(AuthenticatedUser(principal)): Extension<AuthenticatedUser>,
) -> Json<Principal> {
    Json(principal)
}

/// `POST /auth/revoke`: revoke any token. Requires `tokens:revoke`.
pub async fn revoke_handler(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Extension(AuthenticatedUser(principal)): Extension<AuthenticatedUser>,
    Json(body): Json<RevokeRequest>,
) -> AppResult<StatusCode> {
    if !principal.has_permission(REVOKE_PERMISSION) {
        return Err(AppError::Forbidden(format!(
            "Missing permission {REVOKE_PERMISSION}"
        )));
    }
    let reason = match body.reason.as_deref() {
        None => RevocationReason::AdminRevoke,
        Some(s) => s
            .parse::<RevocationReason>()
            .map_err(|_| AppError::Validation(format!("Unknown revocation reason: {s}")))?,
    };

    let auth = Arc::clone(&state.auth);
    let ctx = RequestContext::from_client(client);
    let token = body.token;
    match run_detached(async move { auth.revoke_token(&ctx, &token, reason).await }).await {
        Ok(()) => {
            info!(admin = %principal.user_id, reason = %reason, "token revoked by administrator");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) if e.is_token_error() => {
            Err(AppError::Validation("Token is not a valid Bastion token".into()))
        }
        Err(e) => Err(e.into()),
    }
}
