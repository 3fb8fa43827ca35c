use std::net::SocketAddr;

use subsync_api::{create_router, AppState, Config, StoreBackend};
use subsync_billing::{PassReport, Reconciler, SyncService, SyncStores};
use subsync_shared::{create_migration_pool, create_pool, run_migrations};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,subsync_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Subsync API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(backend = ?config.store_backend, "Configuration loaded");

    let stores = match config.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(&config.database_url).await?;

            // Migrations go through the direct URL when a pooler sits in front
            let migration_url = config
                .database_direct_url
                .as_ref()
                .unwrap_or(&config.database_url);
            let migration_pool = create_migration_pool(migration_url).await?;
            run_migrations(&migration_pool).await?;
            migration_pool.close().await;

            SyncStores::postgres(pool)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory stores - sync state is lost on restart");
            SyncStores::in_memory()
        }
    };

    let sync = SyncService::from_env(stores)?;
    tracing::info!(
        job_key = %sync.reconciler.config().job_key,
        holder = %sync.reconciler.holder(),
        "Sync engine initialized"
    );

    let state = AppState::new(sync, config.clone());
    let shutdown = state.shutdown.clone();
    let tasks = state.tasks.clone();

    if config.reconcile_in_process {
        tasks.spawn(reconcile_task(state.sync.reconciler.clone(), shutdown.clone()));
        tracing::info!("In-process reconciliation task started");
    } else {
        tracing::info!("Reconciliation left to the worker (RECONCILE_IN_PROCESS not set)");
    }

    let app = create_router(state);

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Running passes see the cancellation, record their run and release the lease
    shutdown.cancel();
    tasks.close();
    tracing::info!(pending = tasks.len(), "Waiting for background reconciliation");
    tasks.wait().await;

    tracing::info!("Server stopped");
    Ok(())
}

/// Run reconciliation passes on the configured interval until shutdown
async fn reconcile_task(reconciler: Reconciler, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(reconciler.config().interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match reconciler.run_pass(&shutdown).await {
            Ok(PassReport::Completed(summary)) => tracing::info!(
                outcome = %summary.outcome,
                examined = summary.records_examined,
                repaired = summary.records_repaired,
                failed = summary.records_failed,
                "In-process reconciliation pass finished"
            ),
            Ok(PassReport::Skipped { job_key }) => {
                tracing::debug!(job_key = %job_key, "Reconciliation lease held elsewhere")
            }
            Err(e) => tracing::error!(error = %e, "Reconciliation pass failed"),
        }
    }

    tracing::info!("In-process reconciliation task stopped");
}

/// Resolve on Ctrl+C or SIGTERM and cancel `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
    token.cancel();
}
