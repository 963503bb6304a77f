//! Authentication subsystem configuration.

use std::time::Duration;

use thiserror::Error;

/// Minimum signing secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Default access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 15;

/// Default refresh token lifetime: 7 days.
pub const DEFAULT_REFRESH_TTL_MINUTES: i64 = 10_080;

/// Default issuer claim.
pub const DEFAULT_ISSUER: &str = "bastion";

/// Default failed login attempts before lockout.
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;

/// Default lockout window: 15 minutes.
pub const DEFAULT_LOCKOUT_WINDOW_MINUTES: i64 = 15;

/// Default ledger sweep interval: 1 hour.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// bcrypt cost factor.
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// Role assigned to newly registered accounts.
pub const DEFAULT_ROLE: &str = "user";

/// Errors raised when a configuration is unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes (got {0})")]
    SecretTooShort(usize),

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("bcrypt cost must be between 4 and 31 (got {0})")]
    BcryptCost(u32),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Options recognised by the auth subsystem.
#[derive(Clone)]
pub struct AuthConfig {
    /// Symmetric signing secret (HS256).
    pub signing_secret: Vec<u8>,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
    pub issuer: String,
    /// Tolerated clock skew when checking expiry. Zero by default.
    pub leeway_secs: i64,
    pub max_login_attempts: u32,
    pub lockout_window_minutes: i64,
    /// Upper bound on distinct client identities tracked by the limiter.
    pub rate_limit_capacity: usize,
    pub sweep_interval_secs: u64,
    pub bcrypt_cost: u32,
    pub default_role: String,
    /// Timeout applied to every credential store and ledger call.
    pub store_timeout_ms: u64,
    pub audit_queue_capacity: usize,
    pub permission_cache_ttl_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("signing_secret", &"<redacted>")
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_minutes", &self.refresh_ttl_minutes)
            .field("issuer", &self.issuer)
            .field("leeway_secs", &self.leeway_secs)
            .field("max_login_attempts", &self.max_login_attempts)
            .field("lockout_window_minutes", &self.lockout_window_minutes)
            .field("rate_limit_capacity", &self.rate_limit_capacity)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("default_role", &self.default_role)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("audit_queue_capacity", &self.audit_queue_capacity)
            .field("permission_cache_ttl_secs", &self.permission_cache_ttl_secs)
            .finish()
    }
}

impl AuthConfig {
    /// Defaults for everything except the secret.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            signing_secret: secret.into(),
            access_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_ttl_minutes: DEFAULT_REFRESH_TTL_MINUTES,
            issuer: DEFAULT_ISSUER.to_string(),
            leeway_secs: 0,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout_window_minutes: DEFAULT_LOCKOUT_WINDOW_MINUTES,
            rate_limit_capacity: 10_000,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            default_role: DEFAULT_ROLE.to_string(),
            store_timeout_ms: 2_000,
            audit_queue_capacity: 1_024,
            permission_cache_ttl_secs: 60,
        }
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort(self.signing_secret.len()));
        }
        if self.access_ttl_minutes <= 0 {
            return Err(ConfigError::NotPositive("access TTL"));
        }
        if self.refresh_ttl_minutes <= 0 {
            return Err(ConfigError::NotPositive("refresh TTL"));
        }
        if self.max_login_attempts == 0 {
            return Err(ConfigError::NotPositive("max login attempts"));
        }
        if self.lockout_window_minutes <= 0 {
            return Err(ConfigError::NotPositive("lockout window"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::NotPositive("sweep interval"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("store timeout"));
        }
        if self.audit_queue_capacity == 0 {
            return Err(ConfigError::NotPositive("audit queue capacity"));
        }
        if self.rate_limit_capacity == 0 {
            return Err(ConfigError::NotPositive("rate limit capacity"));
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::BcryptCost(self.bcrypt_cost));
        }
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Empty("issuer"));
        }
        if self.default_role.trim().is_empty() {
            return Err(ConfigError::Empty("default role"));
        }
        Ok(())
    }

    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_ttl_minutes)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.refresh_ttl_minutes)
    }

    pub fn lockout_window(&self) -> Duration {
        Duration::from_secs(self.lockout_window_minutes.unsigned_abs() * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.permission_cache_ttl_secs)
    }
}
