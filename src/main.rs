use chrono::Utc;
use guildboard::{
    batch::BatchConfig,
    config::AppConfig,
    coordinator::{CoordinatorConfig, CoordinatorRegistry},
    gateway::DiscordGateway,
    vault::{CookieContext, DiscordOAuth, KvStore, SessionVault, SqliteKvStore},
    web::{self, AppState, RefreshRegistry},
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local development reads secrets from .env
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guildboard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Guildboard v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    if config.session.secret.len() < 16 {
        warn!("Session secret is shorter than 16 characters");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    let store = Arc::new(SqliteKvStore::init(pool).await?);
    spawn_purge_task(Arc::clone(&store));

    let issuer = Arc::new(DiscordOAuth::new(&config.discord)?);
    let context = CookieContext::from_secure(config.web.is_secure());
    let vault = Arc::new(SessionVault::new(
        store as Arc<dyn KvStore>,
        issuer,
        &config.session,
        context,
    ));
    info!(?context, "Session vault ready");

    let coordinators = Arc::new(CoordinatorRegistry::new(CoordinatorConfig::from(
        &config.coordinator,
    )));
    let gateway = Arc::new(DiscordGateway::new(
        &config.discord.api_base,
        coordinators,
        vault,
    )?);
    let refreshes = Arc::new(RefreshRegistry::new(BatchConfig::from(&config.batch)));
    spawn_idle_sweep(
        Arc::clone(gateway.coordinators()),
        Arc::clone(&refreshes),
        Duration::from_secs(config.session.cookie_max_age_secs),
    );

    let app = web::create_router(AppState::new(gateway, refreshes));

    let web_addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&web_addr).await?;
    info!("Web server listening on http://{}", web_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Guildboard shut down");
    Ok(())
}

/// Periodically drop expired session rows.
fn spawn_purge_task(store: Arc<SqliteKvStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = store.purge_expired().await {
                error!("Session purge failed: {}", e);
            }
        }
    });
}

/// Periodically drop per-user state nobody has touched in a while.
fn spawn_idle_sweep(
    coordinators: Arc<CoordinatorRegistry>,
    refreshes: Arc<RefreshRegistry>,
    max_idle: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let scopes = coordinators.evict_idle().await;
            let users = refreshes.evict_idle(max_idle, Utc::now().timestamp_millis());
            if scopes + users > 0 {
                info!(scopes, users, "Idle state swept");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
