use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collab_core::config::Config;
use collab_core::connection::ConnectionTracker;
use collab_core::dispatcher::{ws_handler, AppState};
use collab_core::document::{InMemoryDocumentAdapter, PgDocumentAdapter, SharedAdapter};
use collab_core::health;
use collab_core::metrics::MetricsRecorder;
use collab_core::middleware::SubmitChain;
use collab_core::presence::PresenceManager;
use collab_core::pubsub::memory::InMemoryPubSub;
use collab_core::pubsub::redis::RedisPubSub;
use collab_core::pubsub::SharedPubSub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        { "debug".to_string() }
        #[cfg(not(debug_assertions))]
        { "info".to_string() }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting collaboration core");

    let config = Config::from_env();

    let metrics_recorder = MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics recorder initialized");

    let store: SharedAdapter = match PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => {
            tracing::info!("connected to postgres document store");
            Arc::new(PgDocumentAdapter::new(pool))
        }
        Err(e) => {
            tracing::warn!(error = %e, "postgres unavailable, falling back to in-memory document store");
            Arc::new(InMemoryDocumentAdapter::new())
        }
    };

    let pubsub: SharedPubSub = match &config.redis_url {
        Some(url) => match RedisPubSub::connect(url, config.pubsub_queue_capacity).await {
            Ok(backend) => {
                tracing::info!("pub/sub backed by redis");
                Arc::new(backend)
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, falling back to in-memory pub/sub");
                Arc::new(InMemoryPubSub::new(config.pubsub_queue_capacity))
            }
        },
        None => {
            tracing::info!("pub/sub backed by in-memory broker");
            Arc::new(InMemoryPubSub::new(config.pubsub_queue_capacity))
        }
    };

    let presence = Arc::new(PresenceManager::new(config.presence_ttl));
    let connections = Arc::new(ConnectionTracker::new(config.max_connections_per_user, config.max_total_connections));

    let app_state = Arc::new(AppState {
        config: config.clone(),
        store,
        pubsub: pubsub.clone(),
        presence: presence.clone(),
        connections: connections.clone(),
        submit_chain: SubmitChain::default_chain(),
    });

    spawn_presence_sweeper(presence);
    spawn_connection_metrics_reporter(connections.clone());
    spawn_connection_reaper(connections);

    let metrics_router = if config.enable_metrics {
        Router::new().route("/metrics", get(collab_core::metrics::metrics_handler)).with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/socket", get(ws_handler))
        .with_state(app_state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(collab_core::metrics::track_request_metrics))
        // Origin checking is left permissive for now; tighten with a
        // named-origin layer before exposing this to untrusted clients.
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_presence_sweeper(presence: Arc<PresenceManager>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let active = presence.sweep_expired();
            metrics::gauge!("presence_records_active").set(active as f64);
            tracing::debug!(active, "presence sweep completed");
        }
    });
}

fn spawn_connection_metrics_reporter(connections: Arc<ConnectionTracker>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(15));
        loop {
            ticker.tick().await;
            metrics::gauge!("ws_connections_active").set(connections.active_count() as f64);
        }
    });
}

/// Force-closes connections that haven't been seen (no pong, no frame) in
/// over 2 minutes, checked every 30 seconds, per the core's keepalive
/// contract.
fn spawn_connection_reaper(connections: Arc<ConnectionTracker>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let reaped = connections.reap_stale(Duration::from_secs(120));
            if reaped > 0 {
                tracing::info!(reaped, "reaped stale connections");
            }
        }
    });
}
