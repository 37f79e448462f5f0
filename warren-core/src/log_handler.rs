// warren-core/src/log_handler.rs
//! Handler that writes everything to the log and talks to no broker.
//! Useful in development where no RabbitMQ is running.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{BrokerChannel, ConsumerHandle, DeliveryCallback};
use crate::config::{BindingOptions, ExchangeConfig, QueueOptions};
use crate::handler::Handler;
use crate::pool::ChannelLease;
use crate::routing::RoutingKeyTemplate;
use crate::types::{Headers, Message};
use crate::WarrenError;

pub struct LogHandler {
    exchange: String,
    channel: Arc<LogChannel>,
}

impl LogHandler {
    pub fn new(exchange: Option<&str>, routing_key_prefix: Option<&str>) -> Self {
        Self {
            exchange: exchange.unwrap_or_default().to_string(),
            channel: Arc::new(LogChannel {
                template: RoutingKeyTemplate::new(routing_key_prefix),
            }),
        }
    }
}

#[async_trait]
impl Handler for LogHandler {
    async fn connect(&self) -> Result<(), WarrenError> {
        debug!("log handler connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WarrenError> {
        debug!("log handler disconnected");
        Ok(())
    }

    async fn checkout(&self) -> Result<ChannelLease, WarrenError> {
        Ok(ChannelLease::detached(self.channel.clone()))
    }

    async fn new_channel(&self) -> Result<Arc<dyn BrokerChannel>, WarrenError> {
        Ok(self.channel.clone())
    }

    async fn publish(&self, message: &dyn Message) -> Result<(), WarrenError> {
        let routing_key = self.channel.template.key_for(message.routing_key());
        self.channel
            .publish(&self.exchange, &routing_key, message.payload(), &message.headers())
            .await
    }
}

pub struct LogChannel {
    template: RoutingKeyTemplate,
}

#[async_trait]
impl BrokerChannel for LogChannel {
    fn routing_key_template(&self) -> &RoutingKeyTemplate {
        &self.template
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WarrenError> {
        debug!(exchange = %exchange.name, kind = ?exchange.options.kind, "declare exchange");
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), WarrenError> {
        debug!(queue = name, durable = options.durable, "declare queue");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        options: &BindingOptions,
    ) -> Result<(), WarrenError> {
        debug!(queue, exchange, routing_key = ?options.routing_key, "bind queue");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), WarrenError> {
        info!(exchange, routing_key, ?headers, "Published");
        debug!(payload = %String::from_utf8_lossy(payload), "published payload");
        Ok(())
    }

    async fn prefetch(&self, _count: u16) -> Result<(), WarrenError> {
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _workers: u16,
        _callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Box<dyn ConsumerHandle>, WarrenError> {
        warn!(queue, consumer_tag, "log handler delivers no messages");
        Ok(Box::new(IdleConsumer {
            consumer_tag: consumer_tag.to_string(),
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WarrenError> {
        debug!(delivery_tag, "ack");
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), WarrenError> {
        debug!(delivery_tag, multiple, requeue, "nack");
        Ok(())
    }

    async fn close(&self) -> Result<(), WarrenError> {
        Ok(())
    }
}

struct IdleConsumer {
    consumer_tag: String,
}

#[async_trait]
impl ConsumerHandle for IdleConsumer {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn cancel(&self) -> Result<(), WarrenError> {
        Ok(())
    }

    async fn drain(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimpleMessage;

    struct Nothing;

    #[async_trait]
    impl DeliveryCallback for Nothing {
        async fn on_delivery(&self, _envelope: crate::types::Envelope) {}
    }

    #[tokio::test]
    async fn publishing_never_fails() {
        let handler = LogHandler::new(Some("ex"), Some("development"));
        handler.connect().await.unwrap();
        handler
            .publish(&SimpleMessage::new("saved.sample", "{}"))
            .await
            .unwrap();
        handler.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn consuming_returns_a_cancellable_handle() {
        let handler = LogHandler::new(None, None);
        let channel = handler.new_channel().await.unwrap();
        let consumer = channel
            .consume("q", "development_q_1", 1, Arc::new(Nothing))
            .await
            .unwrap();
        assert_eq!(consumer.consumer_tag(), "development_q_1");
        consumer.cancel().await.unwrap();
    }
}
