use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use corral::auth::providers::saml::SamlRegistry;
use corral::auth::providers::{GithubProvider, HttpGithubClient, Ldap3Connector, LdapProvider, LocalProvider, SamlProvider};
use corral::auth::{Providers, StateSigner, TokenManager, UserManager};
use corral::catalog::CatalogManager;
use corral::config::Config;
use corral::controller::{Controller, WorkQueue};
use corral::handlers::{auth, catalogs, health, import};
use corral::middleware::{self, AppState};
use corral::models::auth::ProviderKind;
use corral::models::cluster::Node;
use corral::provisioner::versions::MetadataSource;
use corral::provisioner::{EngineService, FailureBackoff, KontainerDriverController, Provisioner, VersionCatalog};
use corral::rbac::crtb::enqueue_on_project_change;
use corral::rbac::{CrtbHandler, KubeTarget, MemoryTarget, PrtbHandler, RbacTarget};
use corral::rbac::RbacManager;
use corral::registration::Registration;
use corral::registry::ClusterRegistry;
use corral::settings::{Settings, RKE_METADATA_CONFIG, SERVER_URL};
use corral::store::{SharedStore, Stores};

const GITHUB_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(name = "corral", version, about = "Multi-cluster Kubernetes management server")]
struct Cli {
    /// Config file, without extension
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        cfg.logging.level = level;
    }
    if let Some(address) = cli.address {
        cfg.server.address = address;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Server starting...");

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let stores = match &cfg.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.database.max_connections)
                .connect(url.expose_secret())
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed successfully");
            Stores::postgres(pool)
        }
        None => {
            warn!("no database configured; records are kept in memory");
            Stores::memory()
        }
    };

    let settings = Settings::new(stores.settings.clone());
    let mut overrides = cfg.settings.clone();
    if let Some(url) = &cfg.server.public_url {
        overrides.entry(SERVER_URL.to_string()).or_insert_with(|| url.clone());
    }
    settings.seed(&overrides).await?;
    let install_uuid = settings.install_uuid().await?;
    settings.spawn_watch();
    info!(%install_uuid, "settings loaded");

    let shutdown = CancellationToken::new();

    // Auth
    let session_ttl_millis = (cfg.auth.session_ttl_minutes * 60 * 1000) as i64;
    let signer = match &cfg.auth.state_secret {
        Some(secret) => StateSigner::new(secret.expose_secret().as_bytes()),
        None => StateSigner::random(),
    };
    let saml_registry = SamlRegistry::new();
    let users = UserManager::new(&stores);
    let tokens = TokenManager::new(stores.tokens.clone(), stores.users.clone(), stores.user_attributes.clone());
    let mut providers = Providers::new(stores.auth_configs.clone(), users, tokens, settings.clone(), session_ttl_millis)
        .with(Arc::new(LocalProvider::new(stores.users.clone())))
        .with(Arc::new(GithubProvider::new(Arc::new(HttpGithubClient::new(GITHUB_TIMEOUT)?))));
    for kind in [ProviderKind::ActiveDirectory, ProviderKind::OpenLdap, ProviderKind::FreeIpa] {
        providers = providers.with(Arc::new(LdapProvider::new(kind, Arc::new(Ldap3Connector))));
    }
    for kind in ProviderKind::ALL.into_iter().filter(|k| k.is_saml()) {
        providers = providers.with_saml(Arc::new(SamlProvider::new(kind, saml_registry.clone(), signer.clone())));
    }
    let providers = Arc::new(providers);

    // Catalogs
    let catalog_manager = Arc::new(CatalogManager::new(
        stores.catalogs.clone(),
        stores.templates.clone(),
        stores.template_versions.clone(),
        settings.clone(),
        &cfg.catalog,
    )?);
    let catalog_queue = WorkQueue::new();
    catalog_queue.watch(&stores.catalogs, |key| Some(key.to_string()));
    catalog_queue.resync(
        stores.catalogs.clone(),
        Duration::from_secs(cfg.catalog.refresh_interval_secs),
        shutdown.clone(),
    );
    tokio::spawn(Controller::new(catalog_manager.clone(), catalog_queue, cfg.workers).run(shutdown.clone()));

    // Registration tokens
    let registration = Arc::new(Registration::new(stores.registration_tokens.clone(), settings.clone()));
    let registration_queue = WorkQueue::new();
    registration_queue.watch(&stores.registration_tokens, |key| Some(key.to_string()));
    tokio::spawn(Controller::new(registration.clone(), registration_queue, cfg.workers).run(shutdown.clone()));

    // Provisioning
    let versions = VersionCatalog::new(&cfg.provisioner.metadata_dir)?;
    spawn_metadata_refresh(versions.clone(), settings.clone(), shutdown.clone());

    let engines = EngineService::new(
        Duration::from_secs(cfg.provisioner.driver_timeout_secs),
        shutdown.clone(),
    );
    let registry = ClusterRegistry::new(stores.clusters.clone());
    let provisioner_queue = WorkQueue::new();
    provisioner_queue.watch(&stores.clusters, |key| Some(key.to_string()));
    registry.register_queue(provisioner_queue.clone());
    let provisioner = Arc::new(Provisioner::new(
        registry,
        stores.nodes.clone(),
        stores.etcd_backups.clone(),
        stores.kontainer_drivers.clone(),
        settings.clone(),
        versions,
        engines,
        FailureBackoff::new(
            Duration::from_secs(cfg.provisioner.backoff_base_secs),
            Duration::from_secs(cfg.provisioner.backoff_max_secs),
        ),
    ));
    spawn_machine_watch(provisioner.clone(), &stores.nodes);
    tokio::spawn(Controller::new(provisioner, provisioner_queue, cfg.workers).run(shutdown.clone()));

    let driver_controller = Arc::new(KontainerDriverController::new(
        stores.kontainer_drivers.clone(),
        cfg.provisioner.driver_dir.clone(),
    )?);
    let driver_queue = WorkQueue::new();
    driver_queue.watch(&stores.kontainer_drivers, |key| Some(key.to_string()));
    tokio::spawn(Controller::new(driver_controller, driver_queue, cfg.workers).run(shutdown.clone()));

    // RBAC projection
    let target: Arc<dyn RbacTarget> = match KubeTarget::try_default().await {
        Ok(target) => Arc::new(target),
        Err(e) => {
            warn!("no kubernetes client available ({}); projecting RBAC in memory", e);
            Arc::new(MemoryTarget::new())
        }
    };
    let rbac = Arc::new(RbacManager::new(&stores, target));

    let crtb_queue = WorkQueue::new();
    crtb_queue.watch(&stores.crtbs, |key| Some(key.to_string()));
    enqueue_on_project_change(&crtb_queue, stores.crtbs.clone(), &stores.projects);
    let crtbs = Arc::new(CrtbHandler::new(rbac.clone(), stores.crtbs.clone()));
    tokio::spawn(Controller::new(crtbs, crtb_queue, cfg.workers).run(shutdown.clone()));

    let prtb_queue = WorkQueue::new();
    prtb_queue.watch(&stores.prtbs, |key| Some(key.to_string()));
    let prtbs = Arc::new(PrtbHandler::new(rbac, stores.prtbs.clone()));
    tokio::spawn(Controller::new(prtbs, prtb_queue, cfg.workers).run(shutdown.clone()));

    // Create application state
    let app_state = Arc::new(AppState {
        stores,
        settings,
        providers,
        registration,
        catalogs: catalog_manager,
        secure_cookies: cfg.auth.secure_cookies,
    });

    let public = Router::new()
        .route("/healthz", get(health::health_check))
        .route("/version", get(health::version))
        .route(
            "/metrics",
            get({
                let handle = metrics_handle.clone();
                move || async move { health::metrics_endpoint(handle.clone()).await }
            }),
        )
        .route("/v3-public/authProviders", get(auth::list_auth_providers))
        .route("/v3-public/:collection/:name", post(auth::login))
        .route("/v1-saml/:provider/saml/metadata", get(auth::saml_metadata))
        .route("/v1-saml/:provider/saml/acs", post(auth::saml_acs))
        .route("/v3/import/:file", get(import::import_manifest))
        .route("/v3/tokens", post(auth::logout));

    // Protected routes (authentication required)
    let protected = Router::new()
        .route("/v3/tokens", get(auth::list_tokens))
        .route("/v3/tokens/:id", get(auth::get_token).delete(auth::delete_token))
        .route("/v3/principals", post(auth::search_principals))
        .route("/v3/principals/:id", get(auth::get_principal))
        .route(
            "/v3/authConfigs/:name",
            put(auth::update_auth_config).post(auth::auth_config_action),
        )
        .route("/v3/catalogs", post(catalogs::refresh_all))
        .route("/v3/catalogs/:id", post(catalogs::catalog_action).get(catalogs::catalog_link))
        .route("/v3/clusterCatalogs/:id", post(catalogs::catalog_action).get(catalogs::catalog_link))
        .route("/v3/projectCatalogs/:id", post(catalogs::catalog_action).get(catalogs::catalog_link))
        .route_layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth_middleware,
        ));

    let app = public
        .merge(protected)
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(axum_middleware::from_fn(middleware::request_logger))
                .layer(axum_middleware::from_fn(middleware::metrics_middleware)),
        );

    let addr: SocketAddr = format!("{}:{}", cfg.server.address, cfg.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Server running");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await?;

    Ok(())
}

/// Node changes re-enqueue the owning cluster.
fn spawn_machine_watch(provisioner: Arc<Provisioner>, nodes: &SharedStore<Node>) {
    let mut events = nodes.watch();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => provisioner.machine_changed(event.key()),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "node watch lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Loads Kubernetes version metadata now and then once a day, or at the
/// interval named in the `rke-metadata-config` setting.
fn spawn_metadata_refresh(versions: VersionCatalog, settings: Settings, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let source = match MetadataSource::parse(&settings.get(RKE_METADATA_CONFIG)) {
                Ok(source) => source,
                Err(e) => {
                    warn!("{}", e);
                    MetadataSource::default()
                }
            };
            if let Err(e) = versions.refresh(&source).await {
                warn!("driverMetadata: {}", e);
            }

            let every = source
                .refresh_interval_minutes
                .parse::<u64>()
                .ok()
                .filter(|m| *m > 0)
                .map_or(METADATA_REFRESH, |m| Duration::from_secs(m * 60));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
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
