mod auth;
mod clock;
mod config;
mod credentials;
mod error;
mod fingerprint;
mod ledger;
#[cfg(feature = "metrics")]
mod metrics;
mod session;
mod telemetry;
mod tokens;
mod users;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use axum::{
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::{delete, get, post},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
#[cfg(test)]
use tokio::sync::Notify;
use tokio::{net::TcpListener, signal, time::MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
use std::sync::Mutex;

use sessionward_core::{GeoTable, Role, User};
use sessionward_crypto::hash_password;
use sessionward_storage::{
    connect, run_migrations, CreateUserError, RefreshSessionStore, StoragePool, UserRepository,
};

#[cfg(feature = "metrics")]
use crate::metrics::{HttpLatencyLayer, MetricsContext};
use crate::{
    clock::SystemClock,
    config::{CliOverrides, LogFormat, ServerConfig, SessionConfig},
    credentials::{CredentialStore, InMemoryCredentialStore, PostgresCredentialStore},
    fingerprint::ForwardingPolicy,
    ledger::{InMemorySessionLedger, PostgresSessionLedger, SessionLedger},
    session::{SessionContext, SessionPolicy},
    telemetry::{init_tracing, HttpOnResponse, HttpSpanMaker, REQUEST_ID_HEADER},
    tokens::TokenCodec,
};

/// Where users and sessions live for this process.
#[derive(Clone)]
enum Persistence {
    /// No `database_url`; in-memory stores.
    Memory,
    Postgres(StoragePool),
    /// Startup could not reach the database; in-memory stores.
    Failed(String),
}

impl Persistence {
    fn component(&self) -> ComponentStatus {
        let (status, details) = match self {
            Persistence::Memory => (
                "in_memory",
                "database_url not configured; sessions are not persisted".to_string(),
            ),
            Persistence::Postgres(_) => ("connected", "migrations applied".to_string()),
            Persistence::Failed(message) => ("error", message.clone()),
        };
        ComponentStatus {
            name: "database",
            status,
            details: Some(details),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self, Persistence::Postgres(_))
    }

    fn pool(&self) -> Option<StoragePool> {
        match self {
            Persistence::Postgres(pool) => Some(pool.clone()),
            Persistence::Memory | Persistence::Failed(_) => None,
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "sessionward-server",
    version,
    about = "Session and device-trust authentication service"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    session_signing_key: Option<String>,
    #[arg(long = "session-fallback-verifying-key", action = ArgAction::Append)]
    session_fallback_verifying_key: Vec<String>,
    #[arg(long)]
    max_devices_per_user: Option<usize>,
    #[arg(long)]
    cookie_secure: Option<bool>,
    #[arg(long)]
    trust_forwarded_headers: Option<bool>,
    #[arg(long)]
    geo_database_path: Option<String>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        let fallback_keys = if self.session_fallback_verifying_key.is_empty() {
            None
        } else {
            Some(self.session_fallback_verifying_key)
        };
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            session_signing_key: self.session_signing_key,
            session_fallback_verifying_keys: fallback_keys,
            max_devices_per_user: self.max_devices_per_user,
            cookie_secure: self.cookie_secure,
            trust_forwarded_headers: self.trust_forwarded_headers,
            geo_database_path: self.geo_database_path,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed a user account into the configured database.
    SeedUser(SeedUserCommand),
    /// Grant a role to a user.
    GrantRole(RoleCommand),
    /// Revoke a role from a user.
    RevokeRole(RoleCommand),
    /// Delete expired refresh sessions.
    PurgeExpired,
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    /// Username for the seeded account.
    #[arg(long)]
    username: String,
    /// Plaintext password for the seeded account.
    #[arg(long)]
    password: String,
    /// Seed the account as an administrator.
    #[arg(long)]
    admin: bool,
}

#[derive(Args, Debug)]
struct RoleCommand {
    /// Username to modify.
    #[arg(long)]
    username: String,
    /// Role to grant or revoke (User or Admin).
    #[arg(long)]
    role: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedUser(cmd) => seed_user(config, cmd).await,
        CliCommand::GrantRole(cmd) => grant_role(config, cmd).await,
        CliCommand::RevokeRole(cmd) => revoke_role(config, cmd).await,
        CliCommand::PurgeExpired => purge_expired(config).await,
    }
}

async fn connect_for(config: &ServerConfig, action: &str) -> Result<StoragePool> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to {action}"))?;
    let pool = connect(database_url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let pool = connect_for(config, "seed users").await?;

    let password_hash = hash_password(&cmd.password)?;
    let mut user = User::new(cmd.username.as_str(), Utc::now());
    if cmd.admin {
        user.roles = vec![Role::Admin.as_str().to_string()];
        user.email_verified = true;
    }

    match UserRepository::create_user(pool.pool(), &user, &password_hash).await {
        Ok(()) => {
            println!(
                "Seeded user '{}' with id {} (roles: {})",
                user.username,
                user.user_id,
                user.roles.join(", ")
            );
            Ok(())
        }
        Err(CreateUserError::UsernameTaken) => {
            println!("User '{}' already exists; skipping", user.username);
            Ok(())
        }
        Err(CreateUserError::Other(err)) => Err(err),
    }
}

async fn grant_role(config: &ServerConfig, cmd: RoleCommand) -> Result<()> {
    let role = validate_role(&cmd.role)?;
    let pool = connect_for(config, "grant roles").await?;
    let store = PostgresCredentialStore::new(pool);

    let user = change_role(&store, &cmd.username, role, RoleChange::Grant).await?;
    println!(
        "Granted role '{}' to user '{}' (id: {})",
        role, user.username, user.user_id
    );
    Ok(())
}

async fn revoke_role(config: &ServerConfig, cmd: RoleCommand) -> Result<()> {
    let role = validate_role(&cmd.role)?;
    let pool = connect_for(config, "revoke roles").await?;
    let store = PostgresCredentialStore::new(pool);

    let user = change_role(&store, &cmd.username, role, RoleChange::Revoke).await?;
    println!(
        "Revoked role '{}' from user '{}' (remaining roles: {})",
        role,
        user.username,
        user.roles.join(", ")
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleChange {
    Grant,
    Revoke,
}

async fn change_role(
    store: &dyn CredentialStore,
    username: &str,
    role: Role,
    change: RoleChange,
) -> Result<User> {
    let username = username.trim();
    if username.is_empty() {
        anyhow::bail!("username must be provided");
    }
    let Some(stored) = store.find_by_username(username).await? else {
        anyhow::bail!("user '{}' not found", username);
    };

    let user_id = stored.user.user_id;
    let now = Utc::now();
    let updated = match change {
        RoleChange::Grant => store.grant_role(user_id, role.as_str(), now).await?,
        RoleChange::Revoke => store.revoke_role(user_id, role.as_str(), now).await?,
    };
    updated.ok_or_else(|| anyhow!("user '{}' disappeared before the update", username))
}

async fn purge_expired(config: &ServerConfig) -> Result<()> {
    let pool = connect_for(config, "purge sessions").await?;
    let purged = RefreshSessionStore::new(pool).purge_expired(Utc::now()).await?;
    println!("Purged {purged} expired sessions");
    Ok(())
}

fn validate_role(raw: &str) -> Result<Role> {
    Role::from_str(raw).map_err(|err| anyhow!("{err}; expected one of User, Admin"))
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no SESSIONWARD_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected SESSIONWARD_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        session_active_signing_key_configured = config.session.active_signing_key.is_some(),
        session_fallback_verifying_key_count = config.session.fallback_verifying_keys.len(),
        access_token_ttl_secs = config.session.access_token_ttl_secs,
        refresh_ttl_days = config.session.refresh_ttl_days,
        max_devices_per_user = config.session.max_devices_per_user,
        trust_forwarded_headers = config.network.trust_forwarded_headers,
        trusted_proxy_count = config.network.trusted_proxies.len(),
        geo_database_configured = config.geo.database_path.is_some(),
        bootstrap_admin_configured = config.bootstrap_admin.is_some(),
        "resolved server configuration"
    );

    let persistence = match config.database_url.as_deref() {
        Some(url) => open_database(url).await,
        None => Persistence::Memory,
    };

    let codec = TokenCodec::from_config(&config.session)?;
    log_signing_key(&config.session, &codec);

    let (credentials, ledger): (Arc<dyn CredentialStore>, Arc<dyn SessionLedger>) =
        match persistence.pool() {
            Some(pool) => (
                Arc::new(PostgresCredentialStore::new(pool.clone())),
                Arc::new(PostgresSessionLedger::new(pool)),
            ),
            None => {
                warn!(
                    "session persistence unavailable; using in-memory credential store and session ledger"
                );
                (
                    Arc::new(InMemoryCredentialStore::new()),
                    Arc::new(InMemorySessionLedger::new()),
                )
            }
        };

    let geo = load_geo_table(&config);
    let session_context = Arc::new(
        SessionContext::new(codec, credentials, ledger, Arc::new(SystemClock))
            .with_geo(Arc::new(geo))
            .with_policy(SessionPolicy::from_config(&config.session)),
    );

    if let Some(admin) = &config.bootstrap_admin {
        match session_context
            .bootstrap_admin(&admin.username, &admin.password)
            .await
        {
            Ok(true) => info!(username = %admin.username, "bootstrapped administrator account"),
            Ok(false) => info!(username = %admin.username, "administrator account already exists"),
            Err(err) => error!(?err, "failed to bootstrap administrator account"),
        }
    }

    spawn_purge_task(session_context.clone(), config.session.purge_interval_secs);

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let state = AppState::new(config.clone(), persistence, session_context)
        .with_forwarding_policy(ForwardingPolicy::from_config(&config));
    #[cfg(feature = "metrics")]
    let state = state.with_metrics(metrics_ctx);

    #[cfg(feature = "metrics")]
    let metrics_state = state.clone();

    let app = build_app(state);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let state = metrics_state;
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn open_database(url: &str) -> Persistence {
    let pool = match connect(url).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(?err, "failed to establish database connection");
            return Persistence::Failed(err.to_string());
        }
    };
    if let Err(err) = run_migrations(&pool).await {
        error!(?err, "failed to apply database migrations");
        return Persistence::Failed(err.to_string());
    }
    info!("database connection established and migrations applied");
    Persistence::Postgres(pool)
}

fn log_signing_key(config: &SessionConfig, codec: &TokenCodec) {
    match (
        config.active_signing_key.is_some(),
        config.fallback_verifying_keys.is_empty(),
    ) {
        (false, _) => {
            info!(
                verifying_key = %codec.verifying_key_base64(),
                "no session signing key supplied; generated ephemeral key"
            );
        }
        (true, false) => {
            info!(
                active_verifying_key = %codec.verifying_key_base64(),
                fallback_keys = config.fallback_verifying_keys.len(),
                "session signing key configured with rotation fallbacks"
            );
        }
        (true, true) => {
            info!(
                verifying_key = %codec.verifying_key_base64(),
                "session signing key loaded from configuration"
            );
        }
    }
}

fn load_geo_table(config: &ServerConfig) -> GeoTable {
    let Some(path) = config.geo.database_path.as_deref() else {
        info!("no geo database configured; session locations will be unknown");
        return GeoTable::new();
    };
    match GeoTable::load(path) {
        Ok(table) => {
            info!(path, networks = table.len(), "loaded geo database");
            table
        }
        Err(err) => {
            error!(?err, path, "failed to load geo database; session locations will be unknown");
            GeoTable::new()
        }
    }
}

fn spawn_purge_task(session: Arc<SessionContext>, interval_secs: u64) {
    if interval_secs == 0 {
        info!("expired session purge disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match session.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired sessions"),
                Err(err) => error!(?err, "failed to purge expired sessions"),
            }
        }
    });
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    persistence: Persistence,
    session: Arc<SessionContext>,
    forwarding: ForwardingPolicy,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        persistence: Persistence,
        session: Arc<SessionContext>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            persistence,
            session,
            forwarding: ForwardingPolicy::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    fn with_forwarding_policy(mut self, forwarding: ForwardingPolicy) -> Self {
        self.forwarding = forwarding;
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }

    fn session(&self) -> Arc<SessionContext> {
        self.session.clone()
    }

    fn session_config(&self) -> &SessionConfig {
        &self.config.session
    }

    fn forwarding_policy(&self) -> &ForwardingPolicy {
        &self.forwarding
    }

    #[cfg(feature = "metrics")]
    fn record_http_request(&self, route: &str, status: u16) {
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
    }

    fn record_login(&self, outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.increment_login(outcome);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (self, outcome);
        }
    }

    fn record_device_cap_eviction(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.increment_device_cap_eviction();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = self;
    }

    #[cfg(feature = "metrics")]
    fn record_db_ready(&self, ready: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.set_db_ready(ready);
        }
    }
}

async fn health(matched_path: MatchedPath, State(state): State<AppState>) -> &'static str {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = (state, matched_path);
    "ok"
}

async fn readiness(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<ReadinessResponse> {
    let ready = state.persistence.is_ready();

    #[cfg(feature = "metrics")]
    {
        state.record_db_ready(ready);
        state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = matched_path;

    Json(ReadinessResponse {
        status: if ready { "ready" } else { "degraded" },
        uptime_seconds: state.uptime_seconds(),
        components: vec![state.persistence.component()],
    })
}

async fn shutdown_signal() {
    #[cfg(test)]
    {
        let notify = TEST_SHUTDOWN_NOTIFY.lock().expect("shutdown lock").clone();
        if let Some(notify) = notify {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(?e, "failed to install Ctrl+C handler");
                    }
                }
                _ = notify.notified() => {}
            }
            info!("shutdown signal received");
            *TEST_SHUTDOWN_NOTIFY.lock().expect("shutdown lock") = None;
            return;
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(matched_path: MatchedPath, State(state): State<AppState>) -> Json<VersionResponse> {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = (state, matched_path);

    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let metrics_enabled = state.metrics_enabled();
    #[cfg(feature = "metrics")]
    let expose_metrics_here = metrics_enabled && state.config.metrics.bind_addr.is_none();
    #[cfg(feature = "metrics")]
    let metrics_ctx = state.metrics();

    let client_v1_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/sessions", get(auth::list_sessions))
        .route("/auth/sessions/{session_id}", delete(auth::revoke_session))
        .route(
            "/auth/sessions/revoke-others",
            post(auth::revoke_other_sessions),
        )
        .route("/auth/sessions/revoke-all", post(auth::revoke_all_sessions))
        .route("/users/me", get(users::me))
        .route("/users/{user_id}/sessions", get(users::user_sessions))
        .route(
            "/users/{user_id}/sessions/revoke-all",
            post(users::revoke_user_sessions),
        )
        .route("/users/{user_id}/roles", post(users::grant_role));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse);

    let builder = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    #[cfg(feature = "metrics")]
    let builder = builder.layer(HttpLatencyLayer::new(metrics_ctx));

    router.layer(builder.into_inner()).with_state(state)
}

#[cfg(test)]
static TEST_SHUTDOWN_NOTIFY: Lazy<Mutex<Option<Arc<Notify>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn install_shutdown_trigger() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *TEST_SHUTDOWN_NOTIFY.lock().expect("shutdown lock") = Some(notify.clone());
    notify
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
