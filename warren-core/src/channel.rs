// warren-core/src/channel.rs
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BindingOptions, ExchangeConfig, QueueOptions};
use crate::routing::RoutingKeyTemplate;
use crate::types::{Envelope, Headers};
use crate::WarrenError;

/// Receives deliveries from an active consumer, on a background task.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_delivery(&self, envelope: Envelope);

    /// The consumer stopped without being cancelled through its
    /// [`ConsumerHandle`], for example because the channel closed.
    async fn on_cancelled(&self) {}
}

/// A running consumer. Cancelling stops future deliveries but does not
/// interrupt one already being processed.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn consumer_tag(&self) -> &str;

    /// Resolves once the broker confirms the cancellation.
    async fn cancel(&self) -> Result<(), WarrenError>;

    /// Waits for deliveries already handed to the callback to finish, then
    /// refuses any that are still buffered. Must not be called from inside a
    /// delivery.
    async fn drain(&self);
}

/// One broker channel. A channel belongs either to a single consumer or to
/// the pool, which lends it to one publisher at a time.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn routing_key_template(&self) -> &RoutingKeyTemplate;

    fn is_open(&self) -> bool {
        true
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WarrenError>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), WarrenError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        options: &BindingOptions,
    ) -> Result<(), WarrenError>;

    /// Publishes with `routing_key` exactly as given.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), WarrenError>;

    /// Caps unacknowledged deliveries in flight on this channel.
    async fn prefetch(&self, count: u16) -> Result<(), WarrenError>;

    /// Starts a manual-ack consumer and returns without waiting for
    /// deliveries. At most `workers` deliveries are processed concurrently.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        workers: u16,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Box<dyn ConsumerHandle>, WarrenError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), WarrenError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), WarrenError>;

    async fn close(&self) -> Result<(), WarrenError>;
}
