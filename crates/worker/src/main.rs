use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use plandiff_core::queue::Subscription;
use plandiff_core::store::Store;
use plandiff_db::{MemoryStore, PgQueue, PgStore};
use plandiff_events::{JobEventBroker, JobEventBus};
use plandiff_pipeline::NoCalloutDetector;
use plandiff_worker::config::StoreBackend;
use plandiff_worker::queue::MemoryQueue;
use plandiff_worker::storage::LocalObjectStore;
use plandiff_worker::{Dispatcher, FlowControl, HandlerContext, LifecycleController, Worker, WorkerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        store = ?config.store_backend,
        max_in_flight = config.max_in_flight,
        memory_budget_mb = config.memory_budget_mb,
        max_lease_secs = config.max_lease_secs,
        "Loaded configuration"
    );

    // --- Persistence and queue ---
    let (store, subscription): (Arc<dyn Store>, Arc<dyn Subscription>) = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set")?;
            let pool = plandiff_db::create_pool(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            plandiff_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            tracing::info!("Database connection established");
            plandiff_db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Database migrations applied");
            (
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgQueue::new(pool, config.lease_extension_secs)),
            )
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store and queue, nothing will persist");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()))
        }
    };

    // --- Event fan-out ---
    // The broker has no in-process subscribers; outward progress surfaces
    // attach through `JobEventBroker::subscribe`.
    let event_bus = Arc::new(JobEventBus::default());
    let broker = Arc::new(JobEventBroker::new());
    let cancel = CancellationToken::new();
    let broker_handle = {
        let broker = Arc::clone(&broker);
        let receiver = event_bus.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.run(receiver, cancel).await })
    };

    // --- Dispatcher and run loop ---
    let objects = Arc::new(LocalObjectStore::new(config.storage_root.clone()));
    let ctx = HandlerContext::new(
        Arc::clone(&store),
        objects,
        Arc::new(NoCalloutDetector),
        &config.pipeline,
    )?;
    let lifecycle = LifecycleController::new(store).with_bus(Arc::clone(&event_bus));
    let dispatcher = Arc::new(Dispatcher::new(ctx, lifecycle));
    let flow = Arc::new(FlowControl::new(
        config.max_in_flight,
        config.memory_budget_bytes(),
        config.working_set_bytes(),
    ));
    let worker = Worker::new(subscription, dispatcher, Arc::clone(&flow), config.runner());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    worker.run(cancel.clone()).await;

    // --- Post-shutdown cleanup ---
    flow.close();
    cancel.cancel();
    if join_broker(broker_handle, Duration::from_secs(5)).await {
        tracing::info!("Event broker stopped");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for the broker task. Returns `false`, after logging, when it
/// panicked or outlived `timeout`.
async fn join_broker(handle: JoinHandle<()>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Event broker task ended abnormally");
            false
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Event broker did not stop in time"
            );
            false
        }
    }
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plandiff_worker=debug,plandiff_pipeline=info,plandiff_db=info".into()),
        )
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
