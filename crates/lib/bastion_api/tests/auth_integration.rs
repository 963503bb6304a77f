//! Integration tests: drive the router end to end against in-memory stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bastion_api::config::ApiConfig;
use bastion_api::{AppState, router};
use bastion_core::auth::AuthError;
use bastion_core::auth::audit::{AuditSink, TracingAuditWriter};
use bastion_core::auth::credentials::{CredentialStore, MemoryCredentialStore};
use bastion_core::auth::ledger::MemoryLedger;
use bastion_core::auth::password::BcryptHasher;
use bastion_core::auth::rate_limit::LoginRateLimiter;
use bastion_core::auth::service::AuthService;
use bastion_core::config::AuthConfig;
use bastion_core::models::auth::{CredentialRecord, NewUser, TokenKind};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &[u8] = b"integration-test-secret-0123456789abcdef";
const CLIENT: &str = "203.0.113.10";

/// Wraps the in-memory store and counts username lookups, i.e. credential
/// checks performed by login. Lookups fail while `offline` is set.
struct CountingStore {
    inner: Arc<MemoryCredentialStore>,
    lookups: AtomicUsize,
    offline: AtomicBool,
}

#[async_trait]
impl CredentialStore for CountingStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, AuthError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthError::UpstreamStoreUnavailable("connection refused".into()));
        }
        self.inner.find_by_username(username).await
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError> {
        self.inner.find_by_id(user_id).await
    }

    async fn create_user(&self, user: NewUser) -> Result<CredentialRecord, AuthError> {
        self.inner.create_user(user).await
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<String>, AuthError> {
        self.inner.role_permissions(role).await
    }
}

struct Harness {
    app: Router,
    state: AppState,
    users: Arc<MemoryCredentialStore>,
    store: Arc<CountingStore>,
}

fn harness() -> Harness {
    let mut auth_config = AuthConfig::with_secret(SECRET.to_vec());
    auth_config.bcrypt_cost = 4;

    let users = Arc::new(MemoryCredentialStore::new());
    let store = Arc::new(CountingStore {
        inner: Arc::clone(&users),
        lookups: AtomicUsize::new(0),
        offline: AtomicBool::new(false),
    });
    let (audit, _worker) = AuditSink::spawn(Arc::new(TracingAuditWriter), 256);
    let auth = AuthService::new(
        &auth_config,
        store.clone(),
        Arc::new(MemoryLedger::new()),
        Arc::new(BcryptHasher::new(auth_config.bcrypt_cost)),
        audit,
    )
    .expect("auth service");

    let state = AppState {
        auth: Arc::new(auth),
        rate_limiter: Arc::new(LoginRateLimiter::from_config(&auth_config)),
        config: ApiConfig::new(auth_config),
    };
    Harness {
        app: router(state.clone()),
        state,
        users,
        store,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", CLIENT)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", CLIENT)
        .body(Body::empty())
        .unwrap()
}

fn with_bearer(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    req
}

fn get(uri: &str, token: &str) -> Request<Body> {
    let req = Request::builder()
        .uri(uri)
        .header("x-forwarded-for", CLIENT)
        .body(Body::empty())
        .unwrap();
    with_bearer(req, token)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let resp = app.clone().oneshot(req).await.expect("request");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("parse JSON")
    };
    (status, json, headers)
}

async fn register(app: &Router, username: &str, password: &str) -> Value {
    let (status, body, _) = send(
        app,
        post_json(
            "/auth/register",
            json!({
                "username": username,
                "password": password,
                "email": format!("{username}@example.com"),
                "firstName": "Test",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {body}");
    body
}

async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, Value, axum::http::HeaderMap) {
    send(
        app,
        post_json(
            "/auth/login",
            json!({ "username": username, "password": password }),
        ),
    )
    .await
}

#[tokio::test]
async fn login_protected_route_logout_revokes_access_token() {
    let h = harness();
    register(&h.app, "alice", "Str0ng!Passw0rd#").await;

    let (status, body, headers) = login(&h.app, "alice", "Str0ng!Passw0rd#").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-auth-ratelimit-limit"], "5");
    assert_eq!(headers["x-auth-ratelimit-remaining"], "5");
    let access = body["accessToken"].as_str().expect("access token").to_string();
    assert!(body["refreshToken"].is_string());
    assert_eq!(body["tokenType"], "Bearer");
    assert_eq!(body["user"]["username"], "alice");

    let (status, me, _) = send(&h.app, get("/auth/me", &access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["displayName"], "alice");
    assert_eq!(me["role"], "user");

    let (status, _, _) = send(
        &h.app,
        with_bearer(post_empty("/auth/logout"), &access),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body, _) = send(&h.app, get("/auth/me", &access)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let err = h
        .state
        .auth
        .tokens()
        .validate(&access, TokenKind::Access)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenRevoked));
}

#[tokio::test]
async fn logout_with_refresh_token_ends_the_session() {
    let h = harness();
    let session = register(&h.app, "ivy", "Str0ng!Passw0rd#").await;
    let access = session["accessToken"].as_str().unwrap().to_string();
    let refresh = session["refreshToken"].as_str().unwrap().to_string();

    let (status, _, _) = send(
        &h.app,
        with_bearer(
            post_json("/auth/logout", json!({ "refreshToken": refresh })),
            &access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired token");
}

#[tokio::test]
async fn logout_rejects_another_users_refresh_token() {
    let h = harness();
    let jane = register(&h.app, "jane", "Str0ng!Passw0rd#").await;
    let kim = register(&h.app, "kim", "Str0ng!Passw0rd#").await;
    let jane_access = jane["accessToken"].as_str().unwrap();
    let kim_refresh = kim["refreshToken"].as_str().unwrap().to_string();

    let (status, body, _) = send(
        &h.app,
        with_bearer(
            post_json("/auth/logout", json!({ "refreshToken": kim_refresh })),
            jane_access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    // Nothing was revoked: both sessions stay usable.
    let (status, _, _) = send(&h.app, get("/auth/me", jane_access)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": kim_refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn refresh_rotates_and_original_token_is_single_use() {
    let h = harness();
    let session = register(&h.app, "carol", "Str0ng!Passw0rd#").await;
    let original = session["refreshToken"].as_str().unwrap().to_string();

    let (status, body, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": original })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = body["refreshToken"].as_str().unwrap();
    assert_ne!(rotated, original);
    assert!(body["accessToken"].is_string());

    let (status, body, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": original })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired token");

    let err = h
        .state
        .auth
        .refresh(&Default::default(), &original)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenRevoked));

    let (status, _, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": rotated })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sixth_failed_login_is_throttled_before_credential_check() {
    let h = harness();
    register(&h.app, "bob", "Str0ng!Passw0rd#").await;

    for attempt in 1..=5u32 {
        let (status, body, headers) = login(&h.app, "bob", "wrong-password").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "attempt {attempt}");
        assert_eq!(body["message"], "Invalid credentials");
        assert_eq!(
            headers["x-auth-ratelimit-remaining"],
            (5 - attempt).to_string().as_str()
        );
    }

    let checks_before = h.store.lookups.load(Ordering::SeqCst);
    let (status, body, headers) = login(&h.app, "bob", "Str0ng!Passw0rd#").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert_eq!(headers["x-auth-ratelimit-remaining"], "0");
    assert_eq!(h.store.lookups.load(Ordering::SeqCst), checks_before);
}

#[tokio::test]
async fn store_outage_on_login_keeps_rate_limit_headers() {
    let h = harness();
    register(&h.app, "lena", "Str0ng!Passw0rd#").await;
    let (status, _, _) = login(&h.app, "lena", "wrong-password").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    h.store.offline.store(true, Ordering::SeqCst);
    let (status, body, headers) = login(&h.app, "lena", "Str0ng!Passw0rd#").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "store_unavailable");
    assert_eq!(headers["x-auth-ratelimit-limit"], "5");
    // Outages do not consume the budget.
    assert_eq!(headers["x-auth-ratelimit-remaining"], "4");

    h.store.offline.store(false, Ordering::SeqCst);
    let (status, _, headers) = login(&h.app, "lena", "wrong-password").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers["x-auth-ratelimit-remaining"], "3");
}

#[tokio::test]
async fn unknown_user_and_wrong_password_look_the_same() {
    let h = harness();
    register(&h.app, "dave", "Str0ng!Passw0rd#").await;

    let (s1, b1, _) = login(&h.app, "dave", "nope-nope").await;
    let (s2, b2, _) = login(&h.app, "nobody", "nope-nope").await;
    assert_eq!(s1, StatusCode::UNAUTHORIZED);
    assert_eq!(s1, s2);
    assert_eq!(b1, b2);
}

#[tokio::test]
async fn register_rejects_invalid_input_and_duplicates() {
    let h = harness();
    let (status, body, _) = send(
        &h.app,
        post_json(
            "/auth/register",
            json!({ "username": "x", "password": "short", "email": "no-at-sign" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    register(&h.app, "erin", "Str0ng!Passw0rd#").await;
    let (status, _, _) = send(
        &h.app,
        post_json(
            "/auth/register",
            json!({ "username": "ERIN", "password": "Str0ng!Passw0rd#", "email": "other@example.com" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_bearer_is_anonymous_not_an_error() {
    let h = harness();
    let (status, _, _) = send(&h.app, get("/auth/me", "not.a.jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Public routes keep working with a garbage bearer token.
    register(&h.app, "frank", "Str0ng!Passw0rd#").await;
    let req = with_bearer(
        post_json(
            "/auth/login",
            json!({ "username": "frank", "password": "Str0ng!Passw0rd#" }),
        ),
        "garbage",
    );
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn refresh_token_is_not_accepted_as_bearer() {
    let h = harness();
    let session = register(&h.app, "gina", "Str0ng!Passw0rd#").await;
    let refresh = session["refreshToken"].as_str().unwrap();
    let (status, _, _) = send(&h.app, get("/auth/me", refresh)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_revoke_requires_permission() {
    let h = harness();
    let user = register(&h.app, "henry", "Str0ng!Passw0rd#").await;
    let user_access = user["accessToken"].as_str().unwrap().to_string();
    let user_refresh = user["refreshToken"].as_str().unwrap().to_string();

    let (status, body, _) = send(
        &h.app,
        with_bearer(
            post_json("/auth/revoke", json!({ "token": user_refresh })),
            &user_access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let admin = register(&h.app, "root", "Str0ng!Passw0rd#").await;
    let admin_id = admin["user"]["id"].as_str().unwrap();
    assert!(
        h.users
            .update_user(admin_id, |r| r.role = "admin".to_string())
            .await
    );
    let (_, admin_session, _) = login(&h.app, "root", "Str0ng!Passw0rd#").await;
    let admin_access = admin_session["accessToken"].as_str().unwrap();

    let (status, _, _) = send(
        &h.app,
        with_bearer(
            post_json("/auth/revoke", json!({ "token": user_refresh, "reason": "bogus" })),
            admin_access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &h.app,
        with_bearer(
            post_json(
                "/auth/revoke",
                json!({ "token": user_refresh, "reason": "SECURITY_BREACH" }),
            ),
            admin_access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(
        &h.app,
        post_json("/auth/refresh", json!({ "refreshToken": user_refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
