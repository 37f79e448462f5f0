// warren-core/src/subscription.rs
use std::sync::Arc;
use tracing::debug;

use crate::channel::{BrokerChannel, ConsumerHandle, DeliveryCallback};
use crate::config::QueueConfig;
use crate::WarrenError;

/// Unacknowledged deliveries a subscribed channel may hold at once.
pub const PREFETCH: u16 = 10;

/// A queue, its exchange bindings and the channel it is consumed on.
pub struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    config: QueueConfig,
}

impl Subscription {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: QueueConfig) -> Self {
        Self { channel, config }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn queue_name(&self) -> Result<&str, WarrenError> {
        self.config
            .name
            .as_deref()
            .ok_or_else(|| WarrenError::Configuration("No queue configured".into()))
    }

    /// Declares the queue and every bound exchange, then binds them.
    /// Routing keys are expanded against the channel's prefix. Safe to
    /// repeat.
    pub async fn activate(&self) -> Result<(), WarrenError> {
        let queue = self.queue_name()?;
        self.channel.declare_queue(queue, &self.config.options).await?;

        let template = self.channel.routing_key_template();
        for binding in &self.config.bindings {
            self.channel.declare_exchange(&binding.exchange).await?;
            let options = binding.options.expand(template);
            debug!(
                queue,
                exchange = %binding.exchange.name,
                routing_key = ?options.routing_key,
                "binding queue"
            );
            self.channel
                .bind_queue(queue, &binding.exchange.name, &options)
                .await?;
        }
        Ok(())
    }

    /// Starts consuming with manual acknowledgment and returns without
    /// waiting for deliveries.
    pub async fn subscribe(
        &self,
        consumer_tag: &str,
        workers: u16,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Box<dyn ConsumerHandle>, WarrenError> {
        let queue = self.queue_name()?;
        self.channel.prefetch(PREFETCH).await?;
        self.channel
            .consume(queue, consumer_tag, workers.max(1), callback)
            .await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), WarrenError> {
        self.channel.ack(delivery_tag).await
    }

    /// `requeue` redelivers immediately. Otherwise the message goes to the
    /// queue's dead-letter exchange, if it has one.
    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), WarrenError> {
        self.channel.nack(delivery_tag, multiple, requeue).await
    }
}
