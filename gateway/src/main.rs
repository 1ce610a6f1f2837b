// src/main.rs
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use corral::auth::TokenManager;
use corral::dialer::tunnel::index_registration_tokens;
use corral::dialer::{DialerFactory, TunnelServer};
use corral::store::{Stores, WatchEvent};

use gateway::config::Config;
use gateway::handlers::connect::connect;
use gateway::handlers::health::{health_check, metrics_endpoint};
use gateway::handlers::proxy::proxy;
use gateway::middleware::{logging::request_logger, metrics::metrics_middleware};
use gateway::proxy::ProxyCache;
use gateway::router::ClusterRouter;
use gateway::server::AppState;

/// Main entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cfg = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(?cfg, "Loaded configuration");

    let stores = match &cfg.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.database.max_connections)
                .connect(url.expose_secret())
                .await?;
            info!("Database pool established");
            Stores::postgres(pool)
        }
        None => {
            warn!("no database configured; the gateway only sees in-memory records");
            Stores::memory()
        }
    };

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    index_registration_tokens(&stores.registration_tokens);
    let tokens = TokenManager::new(
        stores.tokens.clone(),
        stores.users.clone(),
        stores.user_attributes.clone(),
    );
    let tunnels = TunnelServer::new();
    let dialers = DialerFactory::new(stores.clusters.clone(), stores.nodes.clone(), tunnels.clone());
    let router = ClusterRouter::new(stores.clusters.clone(), dialers, tokens);
    spawn_proxy_eviction(router.proxies().clone(), &stores);

    let state = Arc::new(AppState {
        router,
        tunnels,
        registration_tokens: stores.registration_tokens.clone(),
    });

    let app = Router::new()
        .route("/v3/connect", get(connect))
        .route("/healthz", get(health_check))
        .route(
            "/metrics",
            get({
                let handle = metrics_handle.clone();
                move || async move { metrics_endpoint(handle.clone()).await }
            }),
        )
        .fallback(proxy)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(axum::middleware::from_fn(request_logger))
                .layer(axum::middleware::from_fn(metrics_middleware)),
        );

    let ip: std::net::IpAddr = cfg.server.address.parse()?;
    let addr = SocketAddr::new(ip, cfg.server.port);
    info!(%addr, "Gateway running");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Drops cached proxies of deleted clusters.
fn spawn_proxy_eviction(proxies: ProxyCache, stores: &Stores) {
    let mut events = stores.clusters.watch();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WatchEvent::Deleted(key)) => proxies.evict(&key),
                Ok(WatchEvent::Applied(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cluster watch lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
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
                warn!("failed to install terminate signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("Shutdown signal received");
}
