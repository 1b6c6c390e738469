use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod consumer;
mod event_sourcing;
mod messaging;
mod metrics;
mod utils;

use crate::config::{Settings, USAGE};
use consumer::{policy_for, ConsumerLoop};
use event_sourcing::{PgDeadLetterTable, PgEventStore};
use messaging::SqsMessageSource;
use utils::{retry_on_transient, RetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,events_to_pgstore=debug")),
        )
        .init();

    tracing::info!("🚀 Starting events-to-pgstore consumer");

    // === 1. Resolve configuration ===
    let settings = match Settings::load().await {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "Configuration is not usable");
            tracing::info!("{USAGE}");
            std::process::exit(1);
        }
    };
    settings.log_summary();

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // Metrics HTTP server runs on its own actix system in a background thread
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = settings.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 3. Connect to the event store ===
    let connect_retry = RetryConfig::default().with_max_attempts(settings.store_connect_attempts);
    let store = match retry_on_transient(connect_retry, |_| PgEventStore::connect(&settings.database))
        .await
        .into_result()
    {
        Ok(store) => store.with_metrics(metrics.clone()),
        Err(e) => {
            tracing::error!(error = %e, "Can't connect to event store");
            std::process::exit(1);
        }
    };

    store.ensure_schema().await?;
    let dead_letters = PgDeadLetterTable::new(store.pool().clone());
    dead_letters.ensure_schema().await?;
    tracing::info!("✅ Event store schema ready");

    // === 4. Queue client ===
    let source = SqsMessageSource::from_settings(&settings.queue).await;
    tracing::info!(queue_url = %settings.queue.url, "📡 Queue client ready");

    // === 5. Shutdown on SIGINT / SIGTERM ===
    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    // === 6. Run the consumer loop until shutdown ===
    let consumer = ConsumerLoop::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(dead_letters),
        policy_for(settings.redelivery),
        settings.queue.receive_request(),
        metrics,
    );
    consumer.run(shutdown).await;

    tracing::info!("👋 Shutdown complete");
    Ok(())
}

fn spawn_signal_handlers(shutdown: CancellationToken) {
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
                shutdown.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up SIGTERM handler: {}", err);
            }
        }
    });
}
