//! Bastion authentication API server binary.
//!
//! With `DATABASE_URL` set, users, revocations and audit records live in
//! Postgres. Without it the server runs on in-memory stores, which is only
//! suitable for development.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bastion_api::config::ApiConfig;
use bastion_core::auth::audit::{AuditSink, AuditWriter, TracingAuditWriter};
use bastion_core::auth::credentials::{CredentialStore, MemoryCredentialStore};
use bastion_core::auth::ledger::{MemoryLedger, RevocationLedger, spawn_sweeper};
use bastion_core::auth::password::BcryptHasher;
use bastion_core::auth::queries::{PgAuditWriter, PgCredentialStore, PgLedger};
use bastion_core::auth::rate_limit::LoginRateLimiter;
use bastion_core::auth::service::AuthService;
use bastion_core::config::{self as defaults, AuthConfig};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "info,bastion_api=debug,bastion_core=debug";

/// CLI arguments. Every option can also be set through the environment.
#[derive(Parser, Debug)]
#[command(name = "bastion_server", about = "Bastion authentication API server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BASTION_BIND_ADDR", default_value = bastion_api::config::DEFAULT_BIND_ADDR)]
    bind_addr: String,

    /// PostgreSQL connection URL. In-memory stores are used when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "BASTION_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// HS256 signing secret, at least 32 bytes.
    #[arg(long, env = "BASTION_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: String,

    #[arg(long, env = "BASTION_ACCESS_TTL_MINUTES", default_value_t = defaults::DEFAULT_ACCESS_TTL_MINUTES)]
    access_ttl_minutes: i64,

    #[arg(long, env = "BASTION_REFRESH_TTL_MINUTES", default_value_t = defaults::DEFAULT_REFRESH_TTL_MINUTES)]
    refresh_ttl_minutes: i64,

    /// Issuer written to and required in every token.
    #[arg(long, env = "BASTION_ISSUER", default_value = defaults::DEFAULT_ISSUER)]
    issuer: String,

    /// Tolerated clock skew in seconds when checking expiry.
    #[arg(long, env = "BASTION_LEEWAY_SECS", default_value_t = 0)]
    leeway_secs: i64,

    #[arg(long, env = "BASTION_MAX_LOGIN_ATTEMPTS", default_value_t = defaults::DEFAULT_MAX_LOGIN_ATTEMPTS)]
    max_login_attempts: u32,

    #[arg(long, env = "BASTION_LOCKOUT_WINDOW_MINUTES", default_value_t = defaults::DEFAULT_LOCKOUT_WINDOW_MINUTES)]
    lockout_window_minutes: i64,

    /// Maximum number of client identities tracked by the login limiter.
    #[arg(long, env = "BASTION_RATE_LIMIT_CAPACITY", default_value_t = 10_000)]
    rate_limit_capacity: usize,

    #[arg(long, env = "BASTION_SWEEP_INTERVAL_SECS", default_value_t = defaults::DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval_secs: u64,

    #[arg(long, env = "BASTION_BCRYPT_COST", default_value_t = defaults::DEFAULT_BCRYPT_COST)]
    bcrypt_cost: u32,

    /// Role assigned to newly registered users.
    #[arg(long, env = "BASTION_DEFAULT_ROLE", default_value = defaults::DEFAULT_ROLE)]
    default_role: String,

    #[arg(long, env = "BASTION_STORE_TIMEOUT_MS", default_value_t = 2_000)]
    store_timeout_ms: u64,

    #[arg(long, env = "BASTION_AUDIT_QUEUE_CAPACITY", default_value_t = 1_024)]
    audit_queue_capacity: usize,

    #[arg(long, env = "BASTION_PERMISSION_CACHE_TTL_SECS", default_value_t = 60)]
    permission_cache_ttl_secs: u64,

    /// Derive client identity from X-Forwarded-For / X-Real-IP.
    #[arg(
        long,
        env = "BASTION_TRUST_FORWARDED_HEADERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    trust_forwarded_headers: bool,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            signing_secret: self.signing_secret.clone().into_bytes(),
            access_ttl_minutes: self.access_ttl_minutes,
            refresh_ttl_minutes: self.refresh_ttl_minutes,
            issuer: self.issuer.clone(),
            leeway_secs: self.leeway_secs,
            max_login_attempts: self.max_login_attempts,
            lockout_window_minutes: self.lockout_window_minutes,
            rate_limit_capacity: self.rate_limit_capacity,
            sweep_interval_secs: self.sweep_interval_secs,
            bcrypt_cost: self.bcrypt_cost,
            default_role: self.default_role.clone(),
            store_timeout_ms: self.store_timeout_ms,
            audit_queue_capacity: self.audit_queue_capacity,
            permission_cache_ttl_secs: self.permission_cache_ttl_secs,
        }
    }
}

/// Stores selected at startup.
struct Backends {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn RevocationLedger>,
    audit_writer: Arc<dyn AuditWriter>,
}

async fn connect_backends(args: &Args) -> Result<Backends, Box<dyn std::error::Error>> {
    let Some(database_url) = args.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using in-memory stores (development only)");
        return Ok(Backends {
            credentials: Arc::new(MemoryCredentialStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
            audit_writer: Arc::new(TracingAuditWriter),
        });
    };

    info!(max_connections = args.max_connections, "connecting to PostgreSQL");
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    info!("running database migrations");
    bastion_core::migrate::migrate(&pool).await?;

    Ok(Backends {
        credentials: Arc::new(PgCredentialStore::new(pool.clone())),
        ledger: Arc::new(PgLedger::new(pool.clone())),
        audit_writer: Arc::new(PgAuditWriter::new(pool)),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let auth_config = args.auth_config();
    auth_config.validate()?;
    info!(bind_addr = %args.bind_addr, config = ?auth_config, "starting bastion_server");

    let backends = connect_backends(&args).await?;

    let (audit, audit_worker) =
        AuditSink::spawn(backends.audit_writer, auth_config.audit_queue_capacity);
    let hasher = Arc::new(BcryptHasher::new(auth_config.bcrypt_cost));
    let auth = AuthService::new(
        &auth_config,
        backends.credentials,
        Arc::clone(&backends.ledger),
        hasher,
        audit,
    )?;
    let rate_limiter = Arc::new(LoginRateLimiter::from_config(&auth_config));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        backends.ledger,
        auth_config.sweep_interval(),
        shutdown.clone(),
    );
    let purger = rate_limiter.spawn_purge_task(shutdown.clone());

    let config = ApiConfig {
        bind_addr: args.bind_addr.clone(),
        trust_forwarded_headers: args.trust_forwarded_headers,
        auth: auth_config,
    };
    let state = bastion_api::AppState {
        auth: Arc::new(auth),
        rate_limiter,
        config: config.clone(),
    };
    let app = bastion_api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let api_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        }
    })
    .await;

    // Stop background tasks. The audit worker drains once the last sink
    // handle (owned by the router state) is gone.
    shutdown.cancel();
    let _ = sweeper.await;
    let _ = purger.await;
    let _ = audit_worker.await;

    api_result?;
    Ok(())
}
