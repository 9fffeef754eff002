use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filekeeper::{
    api,
    config::{Config, LockBackend},
    coordination::{CounterStore, LeaseStore, RedisCoordinator},
    object_store::LocalStore,
    storage::Database,
    AppState, Services,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "filekeeper starting");

    let config = Config::load()?;
    info!("Loaded configuration for node: {}", config.node.id);

    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    let objects = LocalStore::new(&config.storage.local_storage_path)?;
    info!(
        "Using local storage at: {}",
        config.storage.local_storage_path
    );

    let (leases, counters): (Arc<dyn LeaseStore>, Arc<dyn CounterStore>) =
        match config.coordination.backend {
            LockBackend::Local => {
                info!("Using the local database as lock service");
                let local = Arc::new(db.clone());
                (local.clone() as Arc<dyn LeaseStore>, local as Arc<dyn CounterStore>)
            }
            LockBackend::Redis => {
                let url = config
                    .coordination
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("REDIS_URL is not set"))?;
                let redis = Arc::new(RedisCoordinator::connect(url).await?);
                info!("Using Redis as lock service");
                (redis.clone() as Arc<dyn LeaseStore>, redis as Arc<dyn CounterStore>)
            }
        };

    let state = Arc::new(AppState::new(
        config.clone(),
        Services {
            metadata: Arc::new(db),
            objects: Arc::new(objects),
            leases,
            counters,
        },
    ));

    // Repair drift left by a crash or manual edits before taking traffic
    state.reconciler.reconcile_logged().await;

    let periodic = config
        .reconcile
        .interval_seconds
        .map(|secs| {
            info!(interval_seconds = secs, "Periodic reconciliation enabled");
            Arc::clone(&state.reconciler).spawn_periodic(std::time::Duration::from_secs(secs))
        });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    if let Some(handle) = periodic {
        handle.abort();
    }

    // Let in-flight tasks finish so their leases are released
    state.pool.shutdown().await;

    info!("Shutdown complete");
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
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
