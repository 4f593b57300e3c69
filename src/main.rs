//! ledger_events - Event worker for the ledger backend
//!
//! Subscribes to the ledger event catalogue, logs every event it receives and
//! cancels movements whose processing ends up in the dead-letter queue.

use ledger_events::domain::events::{ALL_EVENT_TYPES, MOVEMENT_CREATED};
use ledger_events::handlers::{LoggingHandler, MovementCompensationHandler};
use ledger_events::{Config, EventManager, SubscribeOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ledger_events=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        exchange = %config.exchange,
        environment = %config.environment,
        "Starting ledger event worker"
    );

    let manager = EventManager::amqp(config);
    manager.initialize().await?;

    for event_type in ALL_EVENT_TYPES {
        manager
            .subscribe(event_type, LoggingHandler::new(event_type), SubscribeOptions::new())
            .await?;
    }
    manager
        .set_dead_letter_handler(
            MOVEMENT_CREATED,
            MovementCompensationHandler::new(manager.publisher()),
        )
        .await?;

    manager.start_consumer().await?;
    tracing::info!(subscriptions = ALL_EVENT_TYPES.len(), "Worker running");

    shutdown_signal().await;

    manager.shutdown().await;
    tracing::info!("Goodbye!");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
