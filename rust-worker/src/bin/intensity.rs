//! impact-intensity-consumer - stores measured and reported shaking intensity.
//!
//! Reported intensities come from the public and are limited to one per
//! source per minute. Measured intensities older than an hour are expired
//! from the database in the background.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use haz::consumers::{spawn_expirer, IntensityHandler};
use haz::ratelimit::{self, RateLimiter};
use haz::store::PgStore;
use haz::transport::{self, AmqpQueue};
use haz::{runtime, Config, Consumer, ConsumerOptions, Gate, HealthGate, Probe, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    info!("worker_starting");

    let config = Config::from_env("impact-intensity-consumer");
    info!(
        queue = %config.queue.name,
        exchange = %config.topic.exchange,
        max_number_of_messages = config.queue.max_number_of_messages,
        visibility_timeout = config.queue.visibility_timeout,
        librato = config.librato.is_some(),
        "config_loaded"
    );

    let token = runtime::cancel_on_shutdown();

    let store = Arc::new(PgStore::new(&config.database).context("Invalid database configuration")?);
    let gate: Gate = HealthGate::new(Arc::clone(&store) as Arc<dyn Probe>);
    if gate.wait_until_healthy(&token).await.is_err() {
        return Ok(());
    }
    info!("database_connected");

    let metrics = runtime::start_metrics(config.librato.clone(), &token)?;

    let limiter = Arc::new(RateLimiter::default());
    let sweeper = ratelimit::spawn_sweeper(Arc::clone(&limiter), token.clone());
    let expirer = spawn_expirer(Arc::clone(&store), token.clone());

    let queue = match AmqpQueue::connect(
        config.queue.clone(),
        Some(config.topic.exchange.clone()),
        &token,
    )
    .await
    {
        Ok(queue) => Arc::new(queue),
        Err(_) => return Ok(()),
    };

    let ingress = transport::start_receiving(
        Arc::clone(&queue),
        config.queue.receive_params(),
        token.clone(),
    );

    let consumer = Consumer::new(
        ingress,
        Supervisor::new(metrics),
        IntensityHandler::new(Arc::clone(&store), limiter),
        Some(gate),
        ConsumerOptions {
            delete_malformed: config.delete_malformed,
            ..Default::default()
        },
    );

    info!("worker_ready");
    consumer.run(token).await;

    let _ = tokio::join!(sweeper, expirer);
    queue.close().await;
    store.close().await;

    info!("worker_shutdown_complete");
    Ok(())
}
