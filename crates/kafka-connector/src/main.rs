//! Kafka connector binary.
//!
//! Consumes whitelisted Kafka topics and invokes the matching functions
//! through the function gateway.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_connector::{run, ConnectorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kafka_connector=info".parse()?))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Kafka connector starting");

    let config = match ConnectorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, error_type = e.error_type(), "Invalid configuration");
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    match run(config, cancel).await {
        Ok(stats) => {
            info!(
                received = stats.received,
                committed = stats.committed,
                redelivered = stats.redelivered,
                "Connector shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, error_type = e.error_type(), "Connector error");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
