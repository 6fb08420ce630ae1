//! Process plumbing shared by the binaries.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LibratoConfig;
use crate::metrics::{self, LibratoSink, Metrics, MetricsSink};

/// Structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// A token that is cancelled on the first shutdown signal.
pub fn cancel_on_shutdown() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("worker_stopping");
        cancel.cancel();
    });

    token
}

/// Start the metrics reporter, shipping to Librato when configured.
pub fn start_metrics(librato: Option<LibratoConfig>, token: &CancellationToken) -> Result<Arc<Metrics>> {
    let sink = match librato {
        Some(config) => {
            let sink = LibratoSink::from_config(config).context("Failed to create Librato client")?;
            Some(Arc::new(sink) as Arc<dyn MetricsSink>)
        }
        None => None,
    };

    let metrics = Metrics::new();
    metrics::spawn_reporter(Arc::clone(&metrics), metrics::WINDOW, sink, token.clone());
    Ok(metrics)
}
