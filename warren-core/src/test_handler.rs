// warren-core/src/test_handler.rs
//! In-memory handler for tests.
//!
//! Published messages are stored only while the handler is enabled, so each
//! test opts in and leaves nothing behind:
//!
//! ```ignore
//! handler.enable();
//! publish_something(&handler).await;
//! assert_eq!(handler.message_count()?, 1);
//! handler.disable();
//! ```
//!
//! Every channel operation is also recorded as a [`BrokerEvent`], and queues
//! with an active consumer can be fed envelopes with [`TestHandler::deliver`].
//! [`TestHandler::cancel_consumer`] and [`TestHandler::fail_settlements`]
//! stand in for a broker that drops consumers or closes channels.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::channel::{BrokerChannel, ConsumerHandle, DeliveryCallback};
use crate::config::{BindingOptions, ExchangeConfig, QueueOptions};
use crate::handler::Handler;
use crate::pool::ChannelLease;
use crate::routing::RoutingKeyTemplate;
use crate::types::{Envelope, Headers, Message, SimpleMessage};
use crate::WarrenError;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    ExchangeDeclared(String),
    QueueDeclared(String),
    QueueBound {
        queue: String,
        exchange: String,
        routing_key: Option<String>,
    },
    Published {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        headers: Headers,
    },
    Prefetch(u16),
    Consumed {
        queue: String,
        consumer_tag: String,
    },
    Cancelled(String),
    Acked(u64),
    Nacked {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Closed,
}

struct ActiveConsumer {
    consumer_tag: String,
    callback: Arc<dyn DeliveryCallback>,
    permits: Arc<Semaphore>,
}

#[derive(Default)]
struct Recorded {
    tracking: bool,
    failing: bool,
    messages: Vec<SimpleMessage>,
    events: Vec<BrokerEvent>,
    consumers: HashMap<String, ActiveConsumer>,
    channels_opened: usize,
}

#[derive(Clone, Default)]
pub struct TestHandler {
    exchange: String,
    template: RoutingKeyTemplate,
    recorded: Arc<Mutex<Recorded>>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_routing_key_prefix(mut self, prefix: &str) -> Self {
        self.template = RoutingKeyTemplate::new(Some(prefix));
        self
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts tracking published messages from a clean slate.
    pub fn enable(&self) {
        let mut recorded = self.recorded();
        recorded.tracking = true;
        recorded.messages.clear();
    }

    pub fn disable(&self) {
        let mut recorded = self.recorded();
        recorded.tracking = false;
        recorded.messages.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.recorded().tracking
    }

    pub fn clear_messages(&self) {
        self.recorded().messages.clear();
    }

    pub fn messages(&self) -> Result<Vec<SimpleMessage>, WarrenError> {
        let recorded = self.recorded();
        if !recorded.tracking {
            return Err(WarrenError::NotTracking);
        }
        Ok(recorded.messages.clone())
    }

    pub fn last_message(&self) -> Result<Option<SimpleMessage>, WarrenError> {
        Ok(self.messages()?.pop())
    }

    pub fn message_count(&self) -> Result<usize, WarrenError> {
        Ok(self.messages()?.len())
    }

    /// Number of tracked messages published with exactly `routing_key`.
    pub fn messages_matching(&self, routing_key: &str) -> Result<usize, WarrenError> {
        Ok(self
            .messages()?
            .iter()
            .filter(|message| message.routing_key == routing_key)
            .count())
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.recorded().events.clone()
    }

    pub fn clear_events(&self) {
        self.recorded().events.clear();
    }

    pub fn channels_opened(&self) -> usize {
        self.recorded().channels_opened
    }

    pub fn is_consuming(&self, queue: &str) -> bool {
        self.recorded().consumers.contains_key(queue)
    }

    /// Makes every ack and nack fail as on a closed channel until turned off.
    pub fn fail_settlements(&self, failing: bool) {
        self.recorded().failing = failing;
    }

    /// Hands `envelope` to the consumer of `queue` and waits for it to be
    /// processed. Returns `false` when nobody consumes the queue or the
    /// consumer has been drained.
    pub async fn deliver(&self, queue: &str, envelope: Envelope) -> bool {
        let active = self
            .recorded()
            .consumers
            .get(queue)
            .map(|active| (Arc::clone(&active.callback), Arc::clone(&active.permits)));
        let Some((callback, permits)) = active else {
            return false;
        };
        let Ok(_permit) = permits.acquire_owned().await else {
            return false;
        };
        callback.on_delivery(envelope).await;
        true
    }

    /// Drops the consumer of `queue` the way a broker does when the queue is
    /// deleted or the channel closes, and tells its callback.
    pub async fn cancel_consumer(&self, queue: &str) -> bool {
        let removed = {
            let mut recorded = self.recorded();
            let removed = recorded.consumers.remove(queue);
            if let Some(active) = &removed {
                let event = BrokerEvent::Cancelled(active.consumer_tag.clone());
                recorded.events.push(event);
            }
            removed
        };
        match removed {
            Some(active) => {
                active.callback.on_cancelled().await;
                true
            }
            None => false,
        }
    }

    /// A channel recording into this handler.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.recorded().channels_opened += 1;
        Arc::new(TestChannel {
            template: self.template.clone(),
            recorded: Arc::clone(&self.recorded),
        })
    }
}

#[async_trait]
impl Handler for TestHandler {
    async fn connect(&self) -> Result<(), WarrenError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WarrenError> {
        Ok(())
    }

    async fn checkout(&self) -> Result<ChannelLease, WarrenError> {
        Ok(ChannelLease::detached(self.channel()))
    }

    async fn new_channel(&self) -> Result<Arc<dyn BrokerChannel>, WarrenError> {
        Ok(self.channel())
    }

    async fn publish(&self, message: &dyn Message) -> Result<(), WarrenError> {
        let routing_key = self.template.key_for(message.routing_key());
        let headers = message.headers();
        let mut recorded = self.recorded();
        recorded.events.push(BrokerEvent::Published {
            exchange: self.exchange.clone(),
            routing_key,
            payload: message.payload().to_vec(),
            headers: headers.clone(),
        });
        if recorded.tracking {
            recorded.messages.push(
                SimpleMessage::new(message.routing_key(), message.payload()).with_headers(headers),
            );
        }
        Ok(())
    }
}

struct TestChannel {
    template: RoutingKeyTemplate,
    recorded: Arc<Mutex<Recorded>>,
}

impl TestChannel {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: BrokerEvent) {
        self.recorded().events.push(event);
    }

    fn settle(&self, event: BrokerEvent) -> Result<(), WarrenError> {
        let mut recorded = self.recorded();
        if recorded.failing {
            return Err(WarrenError::Channel("channel closed".into()));
        }
        recorded.events.push(event);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for TestChannel {
    fn routing_key_template(&self) -> &RoutingKeyTemplate {
        &self.template
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<(), WarrenError> {
        self.record(BrokerEvent::ExchangeDeclared(exchange.name.clone()));
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _options: &QueueOptions) -> Result<(), WarrenError> {
        self.record(BrokerEvent::QueueDeclared(name.to_string()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        options: &BindingOptions,
    ) -> Result<(), WarrenError> {
        self.record(BrokerEvent::QueueBound {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: options.routing_key.clone(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> Result<(), WarrenError> {
        self.record(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), WarrenError> {
        self.record(BrokerEvent::Prefetch(count));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        workers: u16,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Box<dyn ConsumerHandle>, WarrenError> {
        let workers = u32::from(workers.max(1));
        let permits = Arc::new(Semaphore::new(workers as usize));
        let mut recorded = self.recorded();
        if recorded.consumers.contains_key(queue) {
            return Err(WarrenError::Subscribe(format!("{queue} already has a consumer")));
        }
        recorded.consumers.insert(
            queue.to_string(),
            ActiveConsumer {
                consumer_tag: consumer_tag.to_string(),
                callback,
                permits: Arc::clone(&permits),
            },
        );
        recorded.events.push(BrokerEvent::Consumed {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(Box::new(TestConsumer {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            workers,
            permits,
            recorded: Arc::clone(&self.recorded),
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WarrenError> {
        self.settle(BrokerEvent::Acked(delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), WarrenError> {
        self.settle(BrokerEvent::Nacked {
            delivery_tag,
            multiple,
            requeue,
        })
    }

    async fn close(&self) -> Result<(), WarrenError> {
        self.record(BrokerEvent::Closed);
        Ok(())
    }
}

struct TestConsumer {
    queue: String,
    consumer_tag: String,
    workers: u32,
    permits: Arc<Semaphore>,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl ConsumerHandle for TestConsumer {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn cancel(&self) -> Result<(), WarrenError> {
        let mut recorded = self
            .recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let owned = matches!(
            recorded.consumers.get(&self.queue),
            Some(active) if active.consumer_tag == self.consumer_tag
        );
        if owned {
            recorded.consumers.remove(&self.queue);
        }
        recorded.events.push(BrokerEvent::Cancelled(self.consumer_tag.clone()));
        Ok(())
    }

    async fn drain(&self) {
        let _in_flight = self.permits.acquire_many(self.workers).await;
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_are_only_tracked_when_enabled() {
        let handler = TestHandler::new();
        handler.publish(&SimpleMessage::new("k", "ignored")).await.unwrap();
        assert!(matches!(handler.messages(), Err(WarrenError::NotTracking)));

        handler.enable();
        handler.publish(&SimpleMessage::new("k", "one")).await.unwrap();
        handler.publish(&SimpleMessage::new("other", "two")).await.unwrap();

        assert_eq!(handler.message_count().unwrap(), 2);
        assert_eq!(handler.messages_matching("k").unwrap(), 1);
        assert_eq!(handler.last_message().unwrap().unwrap().payload_str(), "two");

        handler.disable();
        handler.enable();
        assert_eq!(handler.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn publishes_under_the_prefixed_key() {
        let handler = TestHandler::new()
            .with_exchange("ex")
            .with_routing_key_prefix("test");
        handler.publish(&SimpleMessage::new("k", "x")).await.unwrap();

        assert!(matches!(
            &handler.events()[..],
            [BrokerEvent::Published { exchange, routing_key, .. }]
                if exchange == "ex" && routing_key == "test.k"
        ));
    }

    #[tokio::test]
    async fn cancelled_consumers_stop_receiving() {
        struct Count(Mutex<usize>);

        #[async_trait]
        impl DeliveryCallback for Count {
            async fn on_delivery(&self, _envelope: Envelope) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let handler = TestHandler::new();
        let count = Arc::new(Count(Mutex::new(0)));
        let consumer = handler
            .channel()
            .consume("q", "tag", 1, count.clone())
            .await
            .unwrap();

        assert!(handler.deliver("q", Envelope::new(1, "k", "a")).await);
        consumer.cancel().await.unwrap();
        assert!(!handler.deliver("q", Envelope::new(2, "k", "b")).await);
        assert!(!handler.is_consuming("q"));
        assert_eq!(*count.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn drained_consumers_refuse_buffered_deliveries() {
        struct Ignore;

        #[async_trait]
        impl DeliveryCallback for Ignore {
            async fn on_delivery(&self, _envelope: Envelope) {}
        }

        let handler = TestHandler::new();
        let consumer = handler
            .channel()
            .consume("q", "tag", 2, Arc::new(Ignore))
            .await
            .unwrap();

        consumer.drain().await;

        assert!(handler.is_consuming("q"));
        assert!(!handler.deliver("q", Envelope::new(1, "k", "a")).await);
    }

    #[tokio::test]
    async fn broker_cancellation_reaches_the_callback() {
        struct Cancelled(Mutex<bool>);

        #[async_trait]
        impl DeliveryCallback for Cancelled {
            async fn on_delivery(&self, _envelope: Envelope) {}

            async fn on_cancelled(&self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let handler = TestHandler::new();
        let cancelled = Arc::new(Cancelled(Mutex::new(false)));
        handler
            .channel()
            .consume("q", "tag", 1, cancelled.clone())
            .await
            .unwrap();
        handler.clear_events();

        assert!(handler.cancel_consumer("q").await);
        assert!(!handler.cancel_consumer("q").await);

        assert!(*cancelled.0.lock().unwrap());
        assert!(!handler.is_consuming("q"));
        assert_eq!(handler.events(), vec![BrokerEvent::Cancelled("tag".into())]);
    }

    #[tokio::test]
    async fn failing_settlements_record_nothing() {
        let handler = TestHandler::new();
        let channel = handler.channel();
        handler.fail_settlements(true);

        assert!(matches!(channel.ack(1).await, Err(WarrenError::Channel(_))));
        assert!(matches!(channel.nack(1, false, true).await, Err(WarrenError::Channel(_))));
        assert!(handler.events().is_empty());

        handler.fail_settlements(false);
        channel.ack(1).await.unwrap();
        assert_eq!(handler.events(), vec![BrokerEvent::Acked(1)]);
    }
}
