//! Authentication service: login, registration, refresh rotation, logout.
//!
//! Refresh token lifecycle: an issued token is `ACTIVE` until it is rotated
//! (redeemed through [`AuthService::refresh`]), revoked (logout or admin
//! action) or expires. Rotation claims the old identifier in the ledger
//! exactly once; a second redemption of the same token fails with
//! `TokenRevoked`.
//!
//! The claim runs on its own task. If it outlives the store deadline the
//! caller gets `UpstreamStoreUnavailable` and the outcome is kept: once the
//! claim lands, one retry with the same token is let through to finish the
//! rotation instead of being rejected as reuse.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditSink};
use super::credentials::CredentialStore;
use super::jwt::TokenService;
use super::keys::SigningKeys;
use super::ledger::RevocationLedger;
use super::password::PasswordHasher;
use super::permissions::PermissionResolver;
use super::{AuthError, with_timeout};
use crate::config::AuthConfig;
use crate::models::auth::{
    AuthSession, CredentialRecord, IdentityClaims, NewUser, Registration, RevocationEntry,
    RevocationReason, TokenClaims, TokenKind, UserInfo,
};

/// Per-request context passed explicitly through the call chain.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Client identity (derived network address), if known.
    pub client: Option<String>,
}

impl RequestContext {
    pub fn from_client(client: impl Into<String>) -> Self {
        Self {
            client: Some(client.into()),
        }
    }

    fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }
}

/// A rotation claim that outlived the store deadline.
struct LateClaim {
    /// `Some(won)` once the claim has completed.
    outcome: watch::Receiver<Option<bool>>,
    /// Expiry of the refresh token being rotated.
    expires_at: DateTime<Utc>,
}

/// Orchestrates credential checks, token issuance and revocation.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    ledger: Arc<dyn RevocationLedger>,
    tokens: Arc<TokenService>,
    permissions: Arc<PermissionResolver>,
    hasher: Arc<dyn PasswordHasher>,
    audit: AuditSink,
    default_role: String,
    store_timeout: Duration,
    /// Hash verified against when the username is unknown, so both failure
    /// paths cost one password verification.
    dummy_hash: String,
    /// Keyed by the old refresh token's `jti`.
    late_claims: Arc<DashMap<String, LateClaim>>,
}

impl AuthService {
    pub fn new(
        config: &AuthConfig,
        store: Arc<dyn CredentialStore>,
        ledger: Arc<dyn RevocationLedger>,
        hasher: Arc<dyn PasswordHasher>,
        audit: AuditSink,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let keys = SigningKeys::hs256(&config.signing_secret)?;
        let permissions = Arc::new(PermissionResolver::new(
            Arc::clone(&store),
            config.permission_cache_ttl(),
        ));
        let tokens = Arc::new(TokenService::new(
            config,
            keys,
            Arc::clone(&ledger),
            Arc::clone(&permissions),
        ));
        let filler: String = rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let dummy_hash = hasher.hash(&filler)?;

        Ok(Self {
            store,
            ledger,
            tokens,
            permissions,
            hasher,
            audit,
            default_role: config.default_role.clone(),
            store_timeout: config.store_timeout(),
            dummy_hash,
            late_claims: Arc::new(DashMap::new()),
        })
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Authenticate with username + password.
    ///
    /// Unknown user and wrong password fail identically. A disabled, locked
    /// or expired account yields `AccountDisabled` only after the password
    /// has been verified; the HTTP layer reports it as bad credentials.
    pub async fn login(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> Result<AuthSession, AuthError> {
        let record = with_timeout(
            self.store_timeout,
            "credential lookup",
            self.store.find_by_username(username),
        )
        .await?;

        let Some(record) = record else {
            // Burn the same CPU as a real verification.
            let _ = self.verify_password(password, &self.dummy_hash).await;
            return Err(self.login_failed(ctx, username, AuthError::InvalidCredentials));
        };

        if !self.verify_password(password, &record.password_hash).await? {
            return Err(self.login_failed(ctx, username, AuthError::InvalidCredentials));
        }

        if !record.is_active() {
            return Err(self.login_failed(ctx, username, AuthError::AccountDisabled));
        }

        let (session, _) = self.mint_session(&record).await?;
        info!(user_id = %record.id, "login succeeded");
        self.audit.record(
            ctx.client(),
            AuditEvent::LoginSucceeded {
                user_id: record.id.clone(),
                username: record.username.clone(),
            },
        );
        Ok(session)
    }

    /// Create an account with the configured default role and log it in.
    pub async fn register(
        &self,
        ctx: &RequestContext,
        registration: Registration,
    ) -> Result<AuthSession, AuthError> {
        let problems = validate_registration(&registration);
        if !problems.is_empty() {
            return Err(AuthError::Validation(problems.join("; ")));
        }

        let password_hash = self.hash_password(&registration.password).await?;
        let new_user = NewUser {
            username: registration.username.trim().to_string(),
            email: registration.email.trim().to_string(),
            password_hash,
            role: self.default_role.clone(),
            first_name: registration.first_name,
            last_name: registration.last_name,
        };

        let created = with_timeout(
            self.store_timeout,
            "create user",
            self.store.create_user(new_user),
        )
        .await;
        let record = match created {
            Ok(record) => record,
            Err(e) => {
                if matches!(e, AuthError::UsernameTaken | AuthError::EmailTaken) {
                    self.audit.record(
                        ctx.client(),
                        AuditEvent::RegistrationRejected {
                            username: registration.username.clone(),
                            reason: e.code().to_string(),
                        },
                    );
                }
                return Err(e);
            }
        };

        info!(user_id = %record.id, username = %record.username, "user registered");
        self.audit.record(
            ctx.client(),
            AuditEvent::Registered {
                user_id: record.id.clone(),
                username: record.username.clone(),
            },
        );
        let (session, _) = self.mint_session(&record).await?;
        Ok(session)
    }

    /// Redeem a refresh token for a new pair, rotating the old one.
    ///
    /// The replacement pair is signed first, which has no side effects.
    /// Claiming the old identifier in the ledger is the serialization point:
    /// only the caller whose claim inserts the entry gets its pair back.
    pub async fn refresh(
        &self,
        ctx: &RequestContext,
        refresh_token: &str,
    ) -> Result<AuthSession, AuthError> {
        let (claims, already_claimed) =
            match self.tokens.verify(refresh_token, TokenKind::Refresh).await {
                Ok(claims) => (claims, false),
                Err(e) => {
                    if matches!(e, AuthError::TokenRevoked)
                        && let Some(claims) = self.resume_late_claim(refresh_token).await?
                    {
                        (claims, true)
                    } else {
                        self.refresh_rejected(ctx, refresh_token, &e);
                        return Err(e);
                    }
                }
            };

        let record = with_timeout(
            self.store_timeout,
            "credential lookup",
            self.store.find_by_id(&claims.sub),
        )
        .await?;
        let record = match record {
            Some(record) if record.is_active() => record,
            _ => {
                let e = AuthError::UserNotFound;
                self.refresh_rejected(ctx, refresh_token, &e);
                return Err(e);
            }
        };

        let (session, new_refresh) = self.mint_session(&record).await?;

        let claimed = already_claimed || self.claim_rotation(&claims).await?;
        if !claimed {
            warn!(user_id = %claims.sub, token_id = %claims.jti, "refresh token reused");
            self.audit.record(
                ctx.client(),
                AuditEvent::RefreshReuseDetected {
                    user_id: claims.sub.clone(),
                    token_id: claims.jti.clone(),
                },
            );
            return Err(AuthError::TokenRevoked);
        }

        debug!(user_id = %record.id, old = %claims.jti, new = %new_refresh.jti, "refresh token rotated");
        self.audit.record(
            ctx.client(),
            AuditEvent::TokenRefreshed {
                user_id: record.id.clone(),
                old_token_id: claims.jti,
                new_token_id: new_refresh.jti,
            },
        );
        Ok(session)
    }

    /// Enter the old refresh token in the ledger as `ROTATED`.
    ///
    /// The claim is spawned so the store deadline only bounds the wait. A
    /// claim still running at the deadline is parked in `late_claims`.
    async fn claim_rotation(&self, claims: &TokenClaims) -> Result<bool, AuthError> {
        let ledger = Arc::clone(&self.ledger);
        let entry = RevocationEntry::for_claims(claims, RevocationReason::Rotated);
        let mut task = tokio::spawn(async move { ledger.claim(entry).await });

        let waited = tokio::time::timeout(self.store_timeout, &mut task).await;
        match waited {
            Ok(joined) => {
                joined.map_err(|e| AuthError::Internal(format!("ledger claim task: {e}")))?
            }
            Err(_) => {
                warn!(
                    user_id = %claims.sub,
                    token_id = %claims.jti,
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "ledger claim timed out, keeping its outcome for a retry"
                );
                let now = Utc::now();
                self.late_claims.retain(|_, late| late.expires_at > now);

                let (tx, rx) = watch::channel(None);
                self.late_claims.insert(
                    claims.jti.clone(),
                    LateClaim {
                        outcome: rx,
                        expires_at: claims.expires_at(),
                    },
                );
                let late_claims = Arc::clone(&self.late_claims);
                let token_id = claims.jti.clone();
                tokio::spawn(async move {
                    let won = matches!(task.await, Ok(Ok(true)));
                    if !won {
                        late_claims.remove(&token_id);
                    }
                    debug!(token_id = %token_id, won, "late ledger claim completed");
                    let _ = tx.send(Some(won));
                });
                Err(AuthError::UpstreamStoreUnavailable(
                    "ledger claim timed out".into(),
                ))
            }
        }
    }

    /// If `token` was rotated by a claim that timed out and won, hand its
    /// claims back once so the retry can finish the rotation.
    async fn resume_late_claim(&self, token: &str) -> Result<Option<TokenClaims>, AuthError> {
        let Ok(claims) = self.tokens.extract_claims_ignoring_expiry(token) else {
            return Ok(None);
        };
        let Some((token_id, mut late)) = self.late_claims.remove(&claims.jti) else {
            return Ok(None);
        };

        let won = {
            let waited = tokio::time::timeout(
                self.store_timeout,
                late.outcome.wait_for(|outcome| outcome.is_some()),
            )
            .await;
            match waited {
                Ok(Ok(outcome)) => Some(*outcome == Some(true)),
                Ok(Err(_)) => Some(false),
                Err(_) => None,
            }
        };

        match won {
            Some(true) => {
                info!(user_id = %claims.sub, token_id = %token_id, "resuming rotation after late ledger claim");
                Ok(Some(claims))
            }
            Some(false) => Ok(None),
            None => {
                self.late_claims.insert(token_id, late);
                Err(AuthError::UpstreamStoreUnavailable(
                    "ledger claim still pending".into(),
                ))
            }
        }
    }

    /// Revoke the presented token with reason `LOGOUT`, and the session's
    /// refresh token too when one is given.
    ///
    /// The refresh token must be a refresh token for the same subject;
    /// otherwise nothing is revoked.
    pub async fn logout(
        &self,
        ctx: &RequestContext,
        token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let claims = self.tokens.extract_claims_ignoring_expiry(token)?;
        let refresh_claims = match refresh_token {
            Some(refresh) => {
                let refresh_claims = self.tokens.extract_claims_ignoring_expiry(refresh)?;
                if refresh_claims.kind != TokenKind::Refresh {
                    return Err(AuthError::WrongTokenKind);
                }
                if refresh_claims.sub != claims.sub {
                    return Err(AuthError::Validation(
                        "Refresh token belongs to a different session".into(),
                    ));
                }
                Some(refresh_claims)
            }
            None => None,
        };

        self.revoke_claims(ctx, &claims, RevocationReason::Logout)
            .await?;
        if let Some(refresh_claims) = refresh_claims {
            self.revoke_claims(ctx, &refresh_claims, RevocationReason::Logout)
                .await?;
        }
        Ok(())
    }

    /// Revoke any token with a valid signature, whatever its kind or expiry.
    pub async fn revoke_token(
        &self,
        ctx: &RequestContext,
        token: &str,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        let claims = self.tokens.extract_claims_ignoring_expiry(token)?;
        self.revoke_claims(ctx, &claims, reason).await
    }

    async fn revoke_claims(
        &self,
        ctx: &RequestContext,
        claims: &TokenClaims,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        with_timeout(
            self.store_timeout,
            "ledger revoke",
            self.ledger.revoke(RevocationEntry::for_claims(claims, reason)),
        )
        .await?;
        info!(user_id = %claims.sub, token_id = %claims.jti, reason = %reason, "token revoked");
        self.audit.record(
            ctx.client(),
            AuditEvent::TokenRevoked {
                user_id: claims.sub.clone(),
                token_id: claims.jti.clone(),
                reason,
            },
        );
        Ok(())
    }

    /// Sign a fresh pair for `record`. Returns the refresh token claims too.
    async fn mint_session(
        &self,
        record: &CredentialRecord,
    ) -> Result<(AuthSession, TokenClaims), AuthError> {
        let permissions = with_timeout(
            self.store_timeout,
            "permission lookup",
            self.permissions.resolve(&record.role),
        )
        .await?;

        let now = Utc::now();
        let identity = IdentityClaims {
            username: record.username.clone(),
            email: Some(record.email.clone()),
        };
        let access = self
            .tokens
            .issue_access_token_at(&record.id, &record.role, &identity, now)?;
        let refresh = self.tokens.issue_refresh_token_at(&record.id, now)?;

        let session = AuthSession {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: self.tokens.access_ttl_secs(),
            access_expires_at: access.claims.expires_at(),
            user: UserInfo {
                id: record.id.clone(),
                username: record.username.clone(),
                email: record.email.clone(),
                first_name: record.first_name.clone(),
                last_name: record.last_name.clone(),
                role: record.role.clone(),
                permissions: (*permissions).clone(),
            },
        };
        Ok((session, refresh.claims))
    }

    fn login_failed(&self, ctx: &RequestContext, username: &str, e: AuthError) -> AuthError {
        debug!(username, reason = e.code(), "login failed");
        self.audit.record(
            ctx.client(),
            AuditEvent::LoginFailed {
                username: username.to_string(),
                reason: e.code().to_string(),
            },
        );
        e
    }

    fn refresh_rejected(&self, ctx: &RequestContext, token: &str, e: &AuthError) {
        if matches!(e, AuthError::TokenRevoked)
            && let Ok(claims) = self.tokens.extract_claims_ignoring_expiry(token)
        {
            warn!(user_id = %claims.sub, token_id = %claims.jti, "revoked refresh token presented");
            self.audit.record(
                ctx.client(),
                AuditEvent::RefreshReuseDetected {
                    user_id: claims.sub,
                    token_id: claims.jti,
                },
            );
            return;
        }
        self.audit.record(
            ctx.client(),
            AuditEvent::RefreshRejected {
                reason: e.code().to_string(),
            },
        );
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("password verify task: {e}")))?
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("password hash task: {e}")))?
    }
}

/// Minimum password length accepted at registration.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Check registration input. Returns a list of problems (empty = valid).
pub fn validate_registration(registration: &Registration) -> Vec<String> {
    let mut errors = Vec::new();

    let username = registration.username.trim();
    if !(3..=64).contains(&username.chars().count()) {
        errors.push("Username must be between 3 and 64 characters".to_string());
    } else if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        errors.push(
            "Username may only contain letters, digits, '_', '.' and '-'".to_string(),
        );
    }

    let email = registration.email.trim();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {}
        _ => errors.push("Email address is invalid".to_string()),
    }

    if registration.password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        ));
    }

    errors
}
