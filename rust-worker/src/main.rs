//! haz-db-consumer - stores quakes and heartbeats from the haz topic.
//!
//! Subscribes its queue to the topic exchange and saves each Quake and
//! HeartBeat to the hazard database. While the database is unreachable the
//! consumer stops pulling messages and waits for it to come back.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use haz::consumers::DbHandler;
use haz::store::PgStore;
use haz::transport::{self, AmqpQueue};
use haz::{runtime, Config, Consumer, ConsumerOptions, Gate, HealthGate, Probe, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    info!("worker_starting");

    let config = Config::from_env("haz-db-consumer");
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
        DbHandler::new(Arc::clone(&store)),
        Some(gate),
        ConsumerOptions {
            delete_malformed: config.delete_malformed,
            ..Default::default()
        },
    );

    info!("worker_ready");
    consumer.run(token).await;

    queue.close().await;
    store.close().await;

    info!("worker_shutdown_complete");
    Ok(())
}
