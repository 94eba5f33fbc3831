//! dcb_engine - Event-Sourced Persistence & Dispatch Engine
//!
//! Boots the dispatch side of the engine: connects the pools, verifies the
//! schema, and runs the leader-elected outbox and view processors until a
//! shutdown signal arrives. Applications embed the library and register
//! their own command handlers, publishers, and view projectors; this binary
//! wires logging publishers so configured topics can be observed end to end.

use std::collections::HashMap;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dcb_engine::clock::{system_clock, InstanceId};
use dcb_engine::config::Config;
use dcb_engine::event_store::EventStore;
use dcb_engine::metrics::tracing_metrics;
use dcb_engine::outbox::{build_outbox_workers, EventPublisher, TracingPublisher};
use dcb_engine::db;
use dcb_engine::processor::{LeaderElector, ProcessorRuntime, ProgressStore};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dcb_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting dcb_engine");
    tracing::info!("Connecting to database...");

    let pools = db::connect(&config).await?;

    if !db::check_schema(pools.primary()).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let clock = system_clock();
    let metrics = tracing_metrics();
    let instance_id = InstanceId::generate();
    tracing::info!(instance = %instance_id, "instance identity assigned");

    let store = EventStore::new(pools.clone(), clock, config.fetch_size)
        .with_isolation(config.transaction_isolation);

    let leader = Arc::new(LeaderElector::new(
        pools.primary().clone(),
        instance_id,
        config.outbox.leader_retry_interval.min(config.views.leader_retry_interval),
        Arc::clone(&metrics),
    ));

    // Every publisher named in the topic map gets a logging stand-in; real
    // sinks come from applications embedding the library.
    let mut publishers: HashMap<String, Arc<dyn EventPublisher>> = HashMap::new();
    for topic in config.topics.values() {
        for name in &topic.publishers {
            publishers
                .entry(name.clone())
                .or_insert_with(|| Arc::new(TracingPublisher));
        }
    }

    let outbox_progress = ProgressStore::outbox(pools.primary().clone());
    let mut outbox_runtime = ProcessorRuntime::new(
        store.clone(),
        outbox_progress.clone(),
        Arc::clone(&leader),
        config.outbox.leader_retry_interval,
    );
    let outbox_workers = build_outbox_workers(
        &store,
        &outbox_progress,
        &leader,
        &metrics,
        &config.outbox.processor,
        &config.topics,
        &publishers,
    )?;
    for worker in outbox_workers {
        outbox_runtime.add_worker(worker);
    }

    let view_progress = ProgressStore::views(pools.primary().clone());
    let mut view_runtime = ProcessorRuntime::new(
        store.clone(),
        view_progress,
        Arc::clone(&leader),
        config.views.leader_retry_interval,
    );

    outbox_runtime.start();
    view_runtime.start();
    tracing::info!("Processor runtimes started");

    shutdown_signal().await;

    tracing::info!("Shutting down...");
    outbox_runtime.shutdown().await;
    view_runtime.shutdown().await;
    pools.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
