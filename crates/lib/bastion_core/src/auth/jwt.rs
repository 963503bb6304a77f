//! JWT token generation and verification.
//!
//! Two layers: [`TokenCodec`] turns claims into a signed compact token and
//! back, checking signature and structure only. [`TokenService`] owns the
//! validity rules: kind, expiry and revocation, in that order, always after
//! the signature has been verified.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation, decode, encode};
use tracing::debug;

use super::keys::SigningKeys;
use super::ledger::RevocationLedger;
use super::permissions::PermissionResolver;
use super::{AuthError, with_timeout};
use crate::config::AuthConfig;
use crate::models::auth::{IdentityClaims, Principal, TokenClaims, TokenKind};
use crate::uuid::token_id;

/// Signs and verifies compact tokens. Stateless.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    keys: SigningKeys,
    issuer: String,
}

impl TokenCodec {
    pub fn new(keys: SigningKeys, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn encode(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        encode(
            &Header::new(self.keys.algorithm()),
            claims,
            self.keys.encoding(),
        )
        .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))
    }

    /// Verify signature, algorithm and issuer and return the claims.
    /// Expiry is deliberately not checked here.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(self.keys.algorithm());
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<TokenClaims>(token, self.keys.decoding(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::SignatureInvalid
                }
                _ => {
                    debug!("token rejected as malformed: {e}");
                    AuthError::MalformedToken
                }
            })
    }
}

/// A freshly signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// Issues access/refresh tokens and validates them against the ledger.
pub struct TokenService {
    codec: TokenCodec,
    ledger: Arc<dyn RevocationLedger>,
    permissions: Arc<PermissionResolver>,
    access_ttl: chrono::Duration,
    refresh_ttl: chrono::Duration,
    leeway_secs: i64,
    store_timeout: Duration,
}

impl TokenService {
    pub fn new(
        config: &AuthConfig,
        keys: SigningKeys,
        ledger: Arc<dyn RevocationLedger>,
        permissions: Arc<PermissionResolver>,
    ) -> Self {
        Self {
            codec: TokenCodec::new(keys, config.issuer.clone()),
            ledger,
            permissions,
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
            leeway_secs: config.leeway_secs.max(0),
            store_timeout: config.store_timeout(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn ledger(&self) -> &Arc<dyn RevocationLedger> {
        &self.ledger
    }

    /// Access token lifetime in seconds.
    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Sign an access token for `subject`. Does not touch the ledger.
    pub fn issue_access_token(
        &self,
        subject: &str,
        role: &str,
        identity: &IdentityClaims,
    ) -> Result<String, AuthError> {
        self.issue_access_token_at(subject, role, identity, Utc::now())
            .map(|issued| issued.token)
    }

    pub fn issue_access_token_at(
        &self,
        subject: &str,
        role: &str,
        identity: &IdentityClaims,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AuthError> {
        let claims = TokenClaims {
            jti: token_id(),
            sub: subject.to_string(),
            kind: TokenKind::Access,
            iss: self.codec.issuer().to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            role: Some(role.to_string()),
            username: Some(identity.username.clone()),
            email: identity.email.clone(),
        };
        let token = self.codec.encode(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    /// Sign a refresh token carrying only the minimal claims.
    pub fn issue_refresh_token(&self, subject: &str) -> Result<String, AuthError> {
        self.issue_refresh_token_at(subject, Utc::now())
            .map(|issued| issued.token)
    }

    pub fn issue_refresh_token_at(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AuthError> {
        let claims = TokenClaims {
            jti: token_id(),
            sub: subject.to_string(),
            kind: TokenKind::Refresh,
            iss: self.codec.issuer().to_string(),
            iat: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
            role: None,
            username: None,
            email: None,
        };
        let token = self.codec.encode(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    /// Validate a token and build the principal it asserts.
    pub async fn validate(&self, token: &str, expected: TokenKind) -> Result<Principal, AuthError> {
        self.validate_at(token, expected, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        token: &str,
        expected: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Principal, AuthError> {
        let claims = self.verify_at(token, expected, now).await?;
        self.principal_for(claims).await
    }

    /// Signature, kind, expiry, then ledger. Returns the verified claims.
    pub async fn verify(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, AuthError> {
        self.verify_at(token, expected, Utc::now()).await
    }

    pub async fn verify_at(
        &self,
        token: &str,
        expected: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, AuthError> {
        let claims = self.codec.decode(token)?;

        if claims.kind != expected {
            return Err(AuthError::WrongTokenKind);
        }

        if now.timestamp() > claims.exp + self.leeway_secs {
            return Err(AuthError::TokenExpired);
        }

        let revoked = with_timeout(
            self.store_timeout,
            "ledger lookup",
            self.ledger.is_revoked(&claims.jti),
        )
        .await?;
        if revoked {
            return Err(AuthError::TokenRevoked);
        }

        Ok(claims)
    }

    /// Read claims from a token whose signature is valid, whatever its
    /// expiry, kind or revocation state.
    pub fn extract_claims_ignoring_expiry(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.codec.decode(token)
    }

    async fn principal_for(&self, claims: TokenClaims) -> Result<Principal, AuthError> {
        let role = claims.role.clone().unwrap_or_default();
        let permissions = if role.is_empty() {
            Default::default()
        } else {
            let resolved = with_timeout(
                self.store_timeout,
                "permission lookup",
                self.permissions.resolve(&role),
            )
            .await?;
            (*resolved).clone()
        };
        let expires_at = claims.expires_at();
        Ok(Principal {
            display_name: claims.username.unwrap_or_else(|| claims.sub.clone()),
            user_id: claims.sub,
            role,
            permissions,
            token_id: claims.jti,
            expires_at,
        })
    }
}
