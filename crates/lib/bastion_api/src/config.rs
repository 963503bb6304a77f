//! API server configuration.

use bastion_core::config::AuthConfig;

/// Default listener address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3100";

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// Derive the client identity from `X-Forwarded-For` / `X-Real-IP` when
    /// present. Only meaningful behind a reverse proxy; the headers are
    /// spoofable otherwise.
    pub trust_forwarded_headers: bool,
    /// Token, limiter and store settings.
    pub auth: AuthConfig,
}

impl ApiConfig {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.into(),
            trust_forwarded_headers: true,
            auth,
        }
    }
}
