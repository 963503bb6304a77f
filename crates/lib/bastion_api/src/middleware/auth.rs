//! Authentication middleware: Bearer token extraction and access-token
//! validation.
//!
//! [`authenticate`] runs on every route and never rejects. A missing or
//! invalid token leaves the request anonymous. [`require_auth`] is layered on
//! protected routes and turns an anonymous request into 401.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use bastion_core::models::auth::{Principal, TokenKind};
use tracing::{debug, warn};

use crate::AppState;
use crate::error::AppError;

/// Principal attached to request extensions for a valid access token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Principal);

/// The raw bearer token that produced the [`AuthenticatedUser`].
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Axum middleware: validate a presented access token and attach the
/// principal. Validation failures of any kind continue anonymously.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(request.headers()).map(str::to_owned) {
        match state.auth.tokens().validate(&token, TokenKind::Access).await {
            Ok(principal) => {
                let extensions = request.extensions_mut();
                extensions.insert(AuthenticatedUser(principal));
                extensions.insert(BearerToken(token));
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "could not validate bearer token, continuing anonymously");
            }
            Err(e) => {
                debug!(reason = e.code(), "bearer token rejected, continuing anonymously");
            }
        }
    }
    next.run(request).await
}

/// Axum middleware: reject requests without an [`AuthenticatedUser`].
pub async fn require_auth(request: Request, next: Next) -> Result<Response, AppError> {
    if request.extensions().get::<AuthenticatedUser>().is_none() {
        return Err(AppError::Unauthorized("Authentication required".into()));
    }
    Ok(next.run(request).await)
}
