//! Message processing metrics.
//!
//! Counters are aggregated over a fixed window. At the end of each window the
//! totals are logged and, when a sink is configured, offered to it through a
//! one-slot buffer. A sink that is still busy with the previous window causes
//! the new one to be dropped; processing never waits on metrics.
//!
//! # Metrics
//!
//! - `Messages.Received` - messages handed to the supervisor
//! - `Messages.Processed` - messages whose processing finished
//! - `Messages.Errors` - messages that finished with an error
//! - `Messages.AverageProcessingTime` - mean processing time in seconds

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LibratoConfig;

/// Aggregation window.
pub const WINDOW: Duration = Duration::from_secs(60);

const LIBRATO_URL: &str = "https://metrics-api.librato.com/v1/metrics";
const SHIP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock-free counters updated by the supervisor.
#[derive(Debug, Default)]
pub struct Metrics {
    received: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    processing_nanos: AtomicU64,
}

/// Totals for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub received: u64,
    pub processed: u64,
    pub errors: u64,
    /// Mean processing time in seconds; zero when nothing was processed.
    pub average_processing_secs: f64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self, elapsed: Duration) {
        self.processing_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset all counters.
    pub fn take_window(&self) -> Window {
        let received = self.received.swap(0, Ordering::Relaxed);
        let processed = self.processed.swap(0, Ordering::Relaxed);
        let errors = self.errors.swap(0, Ordering::Relaxed);
        let nanos = self.processing_nanos.swap(0, Ordering::Relaxed);

        let average_processing_secs = if processed == 0 {
            0.0
        } else {
            nanos as f64 / processed as f64 / 1e9
        };

        Window {
            received,
            processed,
            errors,
            average_processing_secs,
        }
    }
}

/// External destination for metric windows.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn ship(&self, window: &Window) -> anyhow::Result<()>;
}

/// Start logging (and shipping) a window every `period` until cancelled.
pub fn spawn_reporter(
    metrics: Arc<Metrics>,
    period: Duration,
    sink: Option<Arc<dyn MetricsSink>>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let shipper = sink.map(|sink| {
        let (tx, mut rx) = mpsc::channel::<Window>(1);
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let window = tokio::select! {
                    _ = token.cancelled() => break,
                    w = rx.recv() => match w {
                        Some(w) => w,
                        None => break,
                    },
                };
                if let Err(e) = sink.ship(&window).await {
                    warn!(error = %e, "metrics_ship_failed");
                }
            }
        });
        tx
    });

    tokio::spawn(async move {
        info!(
            period_secs = period.as_secs(),
            shipping = shipper.is_some(),
            "metrics_reporter_started"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let window = metrics.take_window();
            info!(
                received = window.received,
                processed = window.processed,
                errors = window.errors,
                average_processing_secs = window.average_processing_secs,
                period_secs = period.as_secs(),
                "metrics"
            );

            if let Some(tx) = &shipper {
                if tx.try_send(window).is_err() {
                    debug!("metrics_window_dropped");
                }
            }
        }
    })
}

// =============================================================================
// Librato
// =============================================================================

#[derive(Serialize)]
struct Gauge<'a> {
    name: &'static str,
    value: f64,
    source: &'a str,
}

#[derive(Serialize)]
struct Gauges<'a> {
    gauges: Vec<Gauge<'a>>,
}

/// Ships windows to Librato Metrics as gauges.
pub struct LibratoSink {
    client: Client,
    config: LibratoConfig,
}

impl LibratoSink {
    pub fn new(client: Client, config: LibratoConfig) -> Self {
        Self { client, config }
    }

    pub fn from_config(config: LibratoConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(SHIP_TIMEOUT).build()?;
        Ok(Self::new(client, config))
    }

    fn body<'a>(&'a self, window: &Window) -> Gauges<'a> {
        let source = self.config.source.as_str();
        Gauges {
            gauges: vec![
                Gauge {
                    name: "Messages.Received",
                    value: window.received as f64,
                    source,
                },
                Gauge {
                    name: "Messages.Processed",
                    value: window.processed as f64,
                    source,
                },
                Gauge {
                    name: "Messages.Errors",
                    value: window.errors as f64,
                    source,
                },
                Gauge {
                    name: "Messages.AverageProcessingTime",
                    value: window.average_processing_secs,
                    source,
                },
            ],
        }
    }
}

#[async_trait]
impl MetricsSink for LibratoSink {
    async fn ship(&self, window: &Window) -> anyhow::Result<()> {
        self.client
            .post(LIBRATO_URL)
            .basic_auth(&self.config.user, Some(&self.config.key))
            .json(&self.body(window))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_take_window_resets() {
        let metrics = Metrics::default();
        metrics.received();
        metrics.received();
        metrics.processed(Duration::from_millis(100));
        metrics.processed(Duration::from_millis(300));
        metrics.error();

        let window = metrics.take_window();
        assert_eq!(window.received, 2);
        assert_eq!(window.processed, 2);
        assert_eq!(window.errors, 1);
        assert!((window.average_processing_secs - 0.2).abs() < 1e-9);

        assert_eq!(
            metrics.take_window(),
            Window {
                received: 0,
                processed: 0,
                errors: 0,
                average_processing_secs: 0.0,
            }
        );
    }

    /// Blocks on every ship until released.
    struct StuckSink {
        shipped: Mutex<Vec<Window>>,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl MetricsSink for StuckSink {
        async fn ship(&self, window: &Window) -> anyhow::Result<()> {
            self.shipped.lock().unwrap().push(window.clone());
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_sink_drops_windows() {
        let metrics = Metrics::new();
        let sink = Arc::new(StuckSink {
            shipped: Mutex::new(Vec::new()),
            release: tokio::sync::Notify::new(),
        });
        let token = CancellationToken::new();

        spawn_reporter(
            Arc::clone(&metrics),
            Duration::from_secs(60),
            Some(sink.clone() as Arc<dyn MetricsSink>),
            token.clone(),
        );

        // Five windows pass while the sink is stuck on the first one: one is
        // being shipped, one waits in the buffer, the rest are dropped.
        for _ in 0..5 {
            metrics.received();
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.shipped.lock().unwrap().len(), 1);

        sink.release.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.shipped.lock().unwrap().len(), 2);

        token.cancel();
    }

    #[test]
    fn test_librato_body() {
        let sink = LibratoSink::new(
            Client::new(),
            LibratoConfig {
                user: "u".to_string(),
                key: "k".to_string(),
                source: "haz-db-consumer".to_string(),
            },
        );
        let window = Window {
            received: 3,
            processed: 3,
            errors: 1,
            average_processing_secs: 0.5,
        };

        let json = serde_json::to_value(sink.body(&window)).unwrap();
        assert_eq!(json["gauges"][0]["name"], "Messages.Received");
        assert_eq!(json["gauges"][0]["value"], 3.0);
        assert_eq!(json["gauges"][2]["value"], 1.0);
        assert_eq!(json["gauges"][3]["source"], "haz-db-consumer");
    }
}
