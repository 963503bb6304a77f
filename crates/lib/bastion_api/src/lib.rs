//! # bastion_api
//!
//! HTTP API library for Bastion.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use bastion_core::auth::rate_limit::LoginRateLimiter;
use bastion_core::auth::service::AuthService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::auth;

/// Route paths.
pub mod routes {
    pub const POST_AUTH_LOGIN: &str = "/auth/login";
    pub const POST_AUTH_REGISTER: &str = "/auth/register";
    pub const POST_AUTH_REFRESH: &str = "/auth/refresh";
    pub const POST_AUTH_LOGOUT: &str = "/auth/logout";
    pub const GET_AUTH_ME: &str = "/auth/me";
    pub const POST_AUTH_REVOKE: &str = "/auth/revoke";
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Login, registration, rotation and revocation.
    pub auth: Arc<AuthService>,
    /// Per-client login throttle.
    pub rate_limiter: Arc<LoginRateLimiter>,
    /// API configuration.
    pub config: ApiConfig,
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public = Router::new()
        .route(routes::POST_AUTH_LOGIN, post(auth::login_handler))
        .route(routes::POST_AUTH_REGISTER, post(auth::register_handler))
        .route(routes::POST_AUTH_REFRESH, post(auth::refresh_handler));

    // Protected routes (require an authenticated principal)
    let protected = Router::new()
        .route(routes::POST_AUTH_LOGOUT, post(auth::logout_handler))
        .route(routes::GET_AUTH_ME, get(auth::me_handler))
        .route(routes::POST_AUTH_REVOKE, post(auth::revoke_handler))
        .route_layer(axum::middleware::from_fn(middleware::auth::require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::authenticate,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
