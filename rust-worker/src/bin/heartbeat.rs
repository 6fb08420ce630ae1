//! haz-heartbeat - publishes a HeartBeat to the haz topic every 15 seconds.
//!
//! Downstream, haz-db-consumer records the latest heartbeat per service as
//! its state of health.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};

use haz::transport::{AmqpTopic, Publisher};
use haz::{runtime, Config, Envelope, HeartBeat};

const INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    info!("worker_starting");

    let config = Config::from_env("haz-heartbeat");
    info!(
        exchange = %config.topic.exchange,
        service_id = %config.heartbeat_service_id,
        retries = config.topic.retries,
        "config_loaded"
    );

    let token = runtime::cancel_on_shutdown();
    let topic = Arc::new(AmqpTopic::new(config.topic.clone()));
    let publisher = Publisher::new(Arc::clone(&topic), token.clone());

    let mut ticker = tokio::time::interval(INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat = HeartBeat::new(config.heartbeat_service_id.as_str(), Utc::now());
        heartbeat.tx_log();

        let body = Envelope::HeartBeat(heartbeat).encode()?;
        if let Err(e) = publisher
            .publish(&body, Some("heartbeat"), config.topic.retries)
            .await
        {
            error!(error = %e, "heartbeat_publish_failed");
        }
    }

    topic.close().await;
    info!("worker_shutdown_complete");
    Ok(())
}
