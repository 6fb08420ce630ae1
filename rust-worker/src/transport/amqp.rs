//! RabbitMQ queue and topic backends using lapin.
//!
//! Mapping onto AMQP:
//! - the topic is a durable fanout exchange; every consumer queue is bound to it
//! - a receipt handle is `{generation}:{delivery tag}`; delivery tags are only
//!   meaningful on the channel that produced them, so every reopened channel
//!   starts a new generation and receipts from older ones are dropped (the
//!   broker has already requeued those deliveries)
//! - the visibility timeout is the queue's `x-consumer-timeout`
//! - delete is `basic.ack`, release is `basic.nack` with requeue, reject is
//!   `basic.nack` without requeue, which routes to `x-dead-letter-exchange`

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{QueueBackend, RawMessage, ReceiptHandle, ReceiveParams, TopicBackend, RETRY_INTERVAL};
use crate::config::{QueueConfig, TopicConfig};
use crate::error::{Cancelled, TransportError};

const SUBJECT_HEADER: &str = "subject";

async fn declare_topic(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
}

fn subject_of(properties: &BasicProperties) -> Option<String> {
    properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == SUBJECT_HEADER)
            .and_then(|(_, v)| match v {
                AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
                _ => None,
            })
    })
}

fn receipt_for(generation: u64, delivery_tag: u64) -> ReceiptHandle {
    ReceiptHandle::new(format!("{}:{}", generation, delivery_tag))
}

/// Split a receipt into channel generation and delivery tag.
fn parse_receipt(receipt: &ReceiptHandle) -> Result<(u64, u64), TransportError> {
    let unknown = || TransportError::UnknownReceipt(receipt.to_string());

    let (generation, tag) = receipt.as_str().split_once(':').ok_or_else(unknown)?;
    Ok((
        generation.parse().map_err(|_| unknown())?,
        tag.parse().map_err(|_| unknown())?,
    ))
}

// =============================================================================
// Queue
// =============================================================================

/// Consumer on one durable queue.
pub struct AmqpQueue {
    config: QueueConfig,
    bind_exchange: Option<String>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    consumer: Mutex<Option<Consumer>>,
    /// Bumped every time a channel is opened.
    generation: AtomicU64,
}

impl AmqpQueue {
    fn unopened(config: QueueConfig, bind_exchange: Option<String>) -> Self {
        Self {
            config,
            bind_exchange,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            consumer: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Connect, retrying until the broker is reachable or `token` is cancelled.
    ///
    /// When `bind_exchange` is set the queue is subscribed to that topic.
    pub async fn connect(
        config: QueueConfig,
        bind_exchange: Option<String>,
        token: &CancellationToken,
    ) -> Result<Self, Cancelled> {
        let queue = Self::unopened(config, bind_exchange);

        loop {
            match queue.open().await {
                Ok(()) => return Ok(queue),
                Err(e) => {
                    warn!(
                        queue = %queue.config.name,
                        error = %e,
                        retry_secs = RETRY_INTERVAL.as_secs(),
                        "rabbitmq_queue_unavailable"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(Cancelled),
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut connection = self.connection.write().await;
        let mut channel = self.channel.write().await;
        let mut consumer = self.consumer.lock().await;

        info!(queue = %self.config.name, "rabbitmq_connecting");

        let conn = Connection::connect(&self.config.url, ConnectionProperties::default()).await?;
        let ch = conn.create_channel().await?;

        ch.basic_qos(
            self.config.max_number_of_messages.clamp(1, u16::MAX as usize) as u16,
            BasicQosOptions::default(),
        )
        .await?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-consumer-timeout"),
            AMQPValue::LongLongInt((self.config.visibility_timeout * 1000) as i64),
        );
        if let Some(dlx) = &self.config.dead_letter_exchange {
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }

        ch.queue_declare(
            &self.config.name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

        if let Some(exchange) = &self.bind_exchange {
            declare_topic(&ch, exchange).await?;
            ch.queue_bind(
                &self.config.name,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        }

        let stream = ch
            .basic_consume(
                &self.config.name,
                "haz-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        *connection = Some(conn);
        *channel = Some(ch);
        *consumer = Some(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            queue = %self.config.name,
            bound_to = ?self.bind_exchange,
            dead_letter_exchange = ?self.config.dead_letter_exchange,
            generation,
            "rabbitmq_consumer_started"
        );

        Ok(())
    }

    async fn current_channel(&self) -> Result<Channel, TransportError> {
        self.channel
            .read()
            .await
            .as_ref()
            .filter(|ch| ch.status().connected())
            .cloned()
            .ok_or(TransportError::Closed)
    }

    /// The channel and tag to settle `receipt` on, or `None` when the receipt
    /// belongs to a channel that has since been replaced.
    async fn settle_target(&self, receipt: &ReceiptHandle) -> Result<Option<(Channel, u64)>, TransportError> {
        let (generation, tag) = parse_receipt(receipt)?;

        // Held while comparing so `open` cannot swap the channel in between.
        let channel = self.channel.read().await;
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            warn!(
                queue = %self.config.name,
                receipt = %receipt,
                current_generation = current,
                "rabbitmq_stale_receipt_dropped"
            );
            return Ok(None);
        }

        let ch = channel
            .as_ref()
            .filter(|ch| ch.status().connected())
            .cloned()
            .ok_or(TransportError::Closed)?;
        Ok(Some((ch, tag)))
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        self.consumer.lock().await.take();

        if let Some(ch) = self.channel.write().await.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = self.connection.write().await.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!(queue = %self.config.name, "rabbitmq_queue_closed");
    }
}

#[async_trait]
impl QueueBackend for AmqpQueue {
    async fn receive(&self, params: &ReceiveParams) -> Result<Vec<RawMessage>, TransportError> {
        if self.current_channel().await.is_err() {
            // Deliveries from the old channel are requeued by the broker.
            self.open().await?;
        }

        let mut guard = self.consumer.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        let consumer = guard.as_mut().ok_or(TransportError::Closed)?;

        let first = match tokio::time::timeout(params.wait_time, consumer.next()).await {
            Err(_elapsed) => return Ok(Vec::new()),
            Ok(None) => {
                guard.take();
                return Err(TransportError::Closed);
            }
            Ok(Some(delivery)) => delivery?,
        };

        let mut deliveries = vec![first];
        while deliveries.len() < params.max_messages {
            match consumer.next().now_or_never() {
                Some(Some(Ok(delivery))) => deliveries.push(delivery),
                Some(Some(Err(e))) => {
                    warn!(error = %e, "rabbitmq_delivery_error");
                    break;
                }
                _ => break,
            }
        }

        Ok(deliveries
            .into_iter()
            .map(|d| RawMessage {
                subject: subject_of(&d.properties),
                body: String::from_utf8_lossy(&d.data).into_owned(),
                receipt: receipt_for(generation, d.delivery_tag),
            })
            .collect())
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        let Some((channel, tag)) = self.settle_target(receipt).await? else {
            return Ok(());
        };
        channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn release(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        let Some((channel, tag)) = self.settle_target(receipt).await? else {
            return Ok(());
        };
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn reject(&self, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        let Some((channel, tag)) = self.settle_target(receipt).await? else {
            return Ok(());
        };
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Topic
// =============================================================================

/// Publisher onto a fanout exchange with broker confirms.
///
/// The connection is opened lazily and re-opened after failures.
pub struct AmqpTopic {
    config: TopicConfig,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpTopic {
    pub fn new(config: TopicConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel, TransportError> {
        {
            let channel = self.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.connection.write().await;
        let mut channel = self.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!(exchange = %self.config.exchange, "rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.config.url, ConnectionProperties::default()).await?;
        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;
        declare_topic(&ch, &self.config.exchange).await?;

        info!(exchange = %self.config.exchange, "rabbitmq_publisher_connected");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.connection.write().await;
        let mut channel = self.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[async_trait]
impl TopicBackend for AmqpTopic {
    async fn publish(&self, body: &str, subject: Option<&str>) -> Result<String, TransportError> {
        let channel = self.ensure_connected().await?;
        let message_id = Uuid::new_v4().to_string();

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_message_id(message_id.clone().into());

        if let Some(subject) = subject {
            let mut headers = FieldTable::default();
            headers.insert(
                ShortString::from(SUBJECT_HEADER),
                AMQPValue::LongString(LongString::from(subject)),
            );
            properties = properties.with_headers(headers);
        }

        let confirmation = channel
            .basic_publish(
                &self.config.exchange,
                "",
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(_) => Ok(message_id),
            Confirmation::Nack(_) => Err(TransportError::NotConfirmed),
            // Without confirms there is no proof of publication.
            Confirmation::NotRequested => Ok(String::new()),
        }
    }
}
