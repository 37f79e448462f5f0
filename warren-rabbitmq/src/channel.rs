use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use warren_core::channel::{BrokerChannel, ConsumerHandle, DeliveryCallback};
use warren_core::config::{BindingOptions, ExchangeConfig, ExchangeKind, QueueOptions};
use warren_core::routing::RoutingKeyTemplate;
use warren_core::types::{Envelope, FieldValue, Fields, Headers};
use warren_core::WarrenError;

const PERSISTENT: u8 = 2;

pub(crate) fn channel_error(err: lapin::Error) -> WarrenError {
    WarrenError::Channel(err.to_string())
}

pub(crate) fn field_table(fields: &Fields) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in fields {
        let value = match value {
            FieldValue::Bool(value) => AMQPValue::Boolean(*value),
            FieldValue::Int(value) => AMQPValue::LongLongInt(*value),
            FieldValue::Float(value) => AMQPValue::Double(*value),
            FieldValue::Str(value) => AMQPValue::LongString(value.clone().into()),
        };
        table.insert(key.clone().into(), value);
    }
    table
}

/// Reads the scalar entries of a broker field table. Nested tables and
/// arrays are skipped.
pub(crate) fn fields(table: &FieldTable) -> Fields {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(value) => FieldValue::Bool(*value),
                AMQPValue::ShortShortInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::ShortShortUInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::ShortInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::ShortUInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::LongInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::LongUInt(value) => FieldValue::Int(i64::from(*value)),
                AMQPValue::LongLongInt(value) => FieldValue::Int(*value),
                AMQPValue::Float(value) => FieldValue::Float(f64::from(*value)),
                AMQPValue::Double(value) => FieldValue::Float(*value),
                AMQPValue::ShortString(value) => FieldValue::Str(value.as_str().to_string()),
                AMQPValue::LongString(value) => {
                    FieldValue::Str(String::from_utf8_lossy(value.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
    template: RoutingKeyTemplate,
}

impl AmqpChannel {
    pub async fn open(
        connection: &Connection,
        template: RoutingKeyTemplate,
        confirms: bool,
    ) -> Result<Self, WarrenError> {
        let channel = connection.create_channel().await.map_err(channel_error)?;
        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(channel_error)?;
        }
        debug!(channel = channel.id(), "opened channel");
        Ok(Self { channel, template })
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn routing_key_template(&self) -> &RoutingKeyTemplate {
        &self.template
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WarrenError> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.options.kind),
                ExchangeDeclareOptions {
                    durable: exchange.options.durable,
                    auto_delete: exchange.options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), WarrenError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map(|_| ())
            .map_err(channel_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        options: &BindingOptions,
    ) -> Result<(), WarrenError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                options.routing_key.as_deref().unwrap_or_default(),
                QueueBindOptions::default(),
                field_table(&options.arguments),
            )
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), WarrenError> {
        let properties = BasicProperties::default()
            .with_headers(field_table(headers))
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| WarrenError::Publish(e.to_string()))?
            .await
            .map_err(|e| WarrenError::Publish(e.to_string()))?;

        if confirm.is_nack() {
            return Err(WarrenError::Publish("publisher confirm NACK".to_string()));
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), WarrenError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(channel_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        workers: u16,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Box<dyn ConsumerHandle>, WarrenError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WarrenError::Subscribe(e.to_string()))?;

        info!(queue, consumer_tag, workers, "Consuming");

        // Each delivery runs on its own task. The semaphore bounds how many
        // are in flight; the stream ends once the consumer is cancelled.
        let workers = workers.max(1);
        let permits = Arc::new(Semaphore::new(usize::from(workers)));
        let cancelled = Arc::new(AtomicBool::new(false));
        let tag = consumer_tag.to_string();
        let drive_permits = Arc::clone(&permits);
        let drive_cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(consumer_tag = %tag, error = %err, "delivery error");
                        break;
                    }
                };
                let Ok(permit) = Arc::clone(&drive_permits).acquire_owned().await else {
                    break;
                };
                let envelope = Envelope {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(fields)
                        .unwrap_or_default(),
                    payload: delivery.data,
                };
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    callback.on_delivery(envelope).await;
                    drop(permit);
                });
            }
            if drive_cancelled.load(Ordering::SeqCst) {
                debug!(consumer_tag = %tag, "consumer stream ended");
            } else {
                warn!(consumer_tag = %tag, "consumer stream ended unexpectedly");
                callback.on_cancelled().await;
            }
        });

        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            consumer_tag: consumer_tag.to_string(),
            workers: u32::from(workers),
            permits,
            cancelled,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WarrenError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(channel_error)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), WarrenError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), WarrenError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel.close(200, "OK").await.map_err(channel_error)
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer_tag: String,
    workers: u32,
    permits: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl ConsumerHandle for AmqpConsumer {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn cancel(&self) -> Result<(), WarrenError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| WarrenError::Subscribe(e.to_string()))
    }

    async fn drain(&self) {
        let _in_flight = self.permits.acquire_many(self.workers).await;
        self.permits.close();
        debug!(consumer_tag = %self.consumer_tag, "drained consumer");
    }
}
