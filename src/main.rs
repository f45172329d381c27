use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mars::config::secrets::{load_or_create_app_secret, resolve_service_credentials};
use mars::config::{Config, Overrides};
use mars::engine::{spawn_schedulers, BatchOrchestrator, HttpMarsApi};
use mars::startup;
use mars::AppState;

#[derive(Parser, Debug)]
#[command(name = "mars")]
#[command(author, version, about = "Listening history and playlist service for Spotify", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mars.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Bootstrap admin email, used only while no admin exists
    #[arg(long, env = "MARS_ADMIN_EMAIL")]
    admin_email: Option<String>,

    #[arg(long, env = "MARS_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Service account used by the scheduled jobs
    #[arg(long, env = "MARS_SERVICE_EMAIL")]
    service_email: Option<String>,

    #[arg(long, env = "MARS_SERVICE_PASSWORD", hide_env_values = true)]
    service_password: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_ID")]
    spotify_client_id: Option<String>,

    #[arg(long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    spotify_client_secret: Option<String>,

    #[arg(long, env = "SPOTIFY_REDIRECT_URI")]
    spotify_redirect_uri: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            admin_email: self.admin_email.clone(),
            admin_password: self.admin_password.clone(),
            service_email: self.service_email.clone(),
            service_password: self.service_password.clone(),
            spotify_client_id: self.spotify_client_id.clone(),
            spotify_client_secret: self.spotify_client_secret.clone(),
            spotify_redirect_uri: self.spotify_redirect_uri.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config)?;
    config.apply_overrides(cli.overrides());
    config.validate()?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Mars v{}", env!("CARGO_PKG_VERSION"));

    startup::ensure_data_dir(&config.server.data_dir)?;

    // Secrets are resolved once; nothing reads them from the environment later
    let secret = load_or_create_app_secret(&config.server.data_dir)?;
    let service_credentials = resolve_service_credentials(&config.auth, &config.server.data_dir)?;

    let db = mars::db::init(&config.server.data_dir).await?;
    let state = Arc::new(AppState::new(config.clone(), db, &secret)?);

    startup::seed_admin(state.store.as_ref(), &state.hasher, &config.auth).await?;
    startup::seed_service_account(state.store.as_ref(), &state.hasher, &service_credentials)
        .await?;

    let cancel = CancellationToken::new();
    let schedulers = if config.scheduler.enabled {
        let api = HttpMarsApi::new(&config.server.api_base_url(), config.scheduler.http_retries)?;
        let orchestrator = Arc::new(BatchOrchestrator::new(
            Arc::new(api),
            service_credentials,
            config.scheduler.user_page_size,
            config.scheduler.max_concurrency,
        ));
        spawn_schedulers(orchestrator, &config.scheduler, cancel.clone())?
    } else {
        tracing::info!("Scheduler disabled");
        Vec::new()
    };

    let app = mars::api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("API server listening on http://{}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    // Schedulers stop at once; a sweep already running finishes first
    cancel.cancel();
    for handle in schedulers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
