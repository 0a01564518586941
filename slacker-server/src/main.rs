use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use slacker_core::Dashboard;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slacker_server::config::Config;
use slacker_server::coordinator::Coordinator;
use slacker_server::github::GitHubClient;
use slacker_server::ingest::{EventIngestor, IngestConfig};
use slacker_server::notify::NotificationScheduler;
use slacker_server::slack::SlackClient;
use slacker_server::status::StatusData;
use slacker_server::store::PersistenceConfig;
use slacker_server::{get_bot_version, AppState, StateStore};

/// How long the persistence worker gets to flush on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ingestor = *state.ingestor.borrow();
    Json(json!({
        "status": "healthy",
        "service": "slacker",
        "version": get_bot_version(),
        "ingestor": ingestor,
    }))
}

async fn tenant_status(
    Path(tenant): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Json<StatusData> {
    let items = state.store.tenant_items(&tenant).await;
    Json(StatusData::from_items(&tenant, items, get_bot_version()))
}

async fn user_dashboard(
    Path((tenant, user)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Dashboard>, StatusCode> {
    let items = state.store.tenant_items(&tenant).await;
    if items.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(Dashboard::build(&user, items)))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting slacker {}", get_bot_version());

    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    info!("Using data directory: {}", config.data_dir.display());
    let store = StateStore::open(&config.data_dir, PersistenceConfig::default()).await?;
    store.preload().await?;
    let persistence = store.start_persistence(cancel.clone())?;

    let github = Arc::new(GitHubClient::new(config.github_token.clone())?);
    let slack = Arc::new(SlackClient::new(config.slack_token.clone())?);

    let notifier = Arc::new(NotificationScheduler::new(
        store.clone(),
        slack.clone(),
        config.users.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        github,
        slack,
        store.clone(),
        notifier.clone(),
        config.routing.clone(),
    ));
    let ingestor = EventIngestor::new(IngestConfig::new(config.sprinkler_url.clone()), coordinator);

    let app_state = Arc::new(AppState {
        store: store.clone(),
        ingestor: ingestor.subscribe(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status/{tenant}", get(tenant_status))
        .route("/status/{tenant}/users/{user}", get(user_dashboard))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    });

    let scheduler = tokio::spawn({
        let notifier = notifier.clone();
        let cancel = cancel.clone();
        async move { notifier.run(cancel).await }
    });

    let ingested = ingestor.run(cancel.clone()).await;
    if let Err(e) = &ingested {
        error!("Event ingestion stopped: {}", e);
    }
    cancel.cancel();

    if let Err(e) = scheduler.await {
        error!("Notification scheduler task failed: {}", e);
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, persistence).await {
        Ok(Ok(())) => info!("State flushed"),
        Ok(Err(e)) => error!("Persistence worker failed: {}", e),
        Err(_) => warn!("Timed out waiting for state to flush"),
    }

    info!("Stopped");
    ingested.map_err(Into::into)
}
