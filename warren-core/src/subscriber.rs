// warren-core/src/subscriber.rs
//! Per-message processing contract.
//!
//! Every delivery must be acknowledged or rejected exactly once. A
//! [`Subscriber`] may settle the delivery itself through [`Delivery::ack`],
//! [`Delivery::requeue`], [`Delivery::dead_letter`] or [`Delivery::delay`];
//! otherwise the delivery is acknowledged once `process` returns `Ok`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, warn};

use crate::delay_exchange::DelayExchange;
use crate::error::{ProcessError, WarrenError};
use crate::subscription::Subscription;
use crate::types::{Envelope, FieldValue, Headers};

/// Retries beyond this many delays are dead-lettered.
pub const MAX_RETRIES: i64 = 30;
pub const ATTEMPTS_HEADER: &str = "attempts";

/// One delivered message together with the means to settle it.
pub struct Delivery {
    envelope: Envelope,
    subscription: Arc<Subscription>,
    delayed: Arc<DelayExchange>,
    acknowledged: bool,
}

impl Delivery {
    pub fn new(envelope: Envelope, subscription: Arc<Subscription>, delayed: Arc<DelayExchange>) -> Self {
        Self {
            envelope,
            subscription,
            delayed,
            acknowledged: false,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.envelope.payload)
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProcessError> {
        Ok(serde_json::from_slice(&self.envelope.payload)?)
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.envelope.delivery_tag
    }

    pub fn headers(&self) -> &Headers {
        &self.envelope.headers
    }

    /// Number of times this message has been delayed so far.
    pub fn attempt(&self) -> i64 {
        self.envelope
            .headers
            .get(ATTEMPTS_HEADER)
            .and_then(FieldValue::as_i64)
            .unwrap_or(0)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub async fn ack(&mut self) -> Result<(), WarrenError> {
        self.ensure_unsettled()?;
        self.subscription.ack(self.delivery_tag()).await?;
        self.acknowledged = true;
        Ok(())
    }

    /// Rejects the message back onto its queue for immediate redelivery.
    pub async fn requeue(&mut self, reason: impl Display + Send) -> Result<(), WarrenError> {
        warn!(
            delivery_tag = self.delivery_tag(),
            routing_key = self.routing_key(),
            reason = %reason,
            "Re-queue: {}",
            self.payload_str()
        );
        self.ensure_unsettled()?;
        self.subscription.nack(self.delivery_tag(), false, true).await?;
        self.acknowledged = true;
        Ok(())
    }

    /// Rejects the message without requeue, routing it to the dead-letter
    /// exchange if the queue has one.
    pub async fn dead_letter(&mut self, reason: impl Display + Send) -> Result<(), WarrenError> {
        error!(
            delivery_tag = self.delivery_tag(),
            routing_key = self.routing_key(),
            reason = %reason,
            "Dead-letter: {}",
            self.payload_str()
        );
        self.ensure_unsettled()?;
        self.subscription.nack(self.delivery_tag(), false, false).await?;
        self.acknowledged = true;
        Ok(())
    }

    /// Sends the message round the delay exchange with its attempt count
    /// bumped, then acknowledges the original. Dead-letters it instead once
    /// it has been delayed more than [`MAX_RETRIES`] times.
    pub async fn delay(&mut self, reason: impl Display + Send) -> Result<(), WarrenError> {
        let attempt = self.attempt();
        if attempt > MAX_RETRIES {
            return self.dead_letter(reason).await;
        }
        self.ensure_unsettled()?;

        warn!(
            delivery_tag = self.delivery_tag(),
            routing_key = self.routing_key(),
            attempt,
            reason = %reason,
            "Delay: {}",
            self.payload_str()
        );
        let mut headers = self.envelope.headers.clone();
        headers.insert(ATTEMPTS_HEADER.to_string(), FieldValue::Int(attempt + 1));
        self.delayed
            .publish(&self.envelope.payload, &self.envelope.routing_key, &headers)
            .await?;
        self.ack().await
    }

    /// Runs `subscriber` and acknowledges the delivery unless it already
    /// settled it.
    pub async fn process_with(&mut self, subscriber: &dyn Subscriber) -> Result<(), ProcessError> {
        subscriber.process(self).await?;
        if !self.acknowledged {
            self.ack().await?;
        }
        Ok(())
    }

    /// A delivery counts as settled only once the broker took the ack or
    /// nack, so a failed call can still be followed by another.
    fn ensure_unsettled(&self) -> Result<(), WarrenError> {
        if self.acknowledged {
            return Err(self.multiple_acknowledgements());
        }
        Ok(())
    }

    fn multiple_acknowledgements(&self) -> WarrenError {
        WarrenError::MultipleAcknowledgements {
            delivery_tag: self.delivery_tag(),
            payload: self.payload_str().into_owned(),
        }
    }
}

/// Application logic for one consumer. A fresh instance handles each
/// delivery.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn process(&self, _delivery: &mut Delivery) -> Result<(), ProcessError> {
        Ok(())
    }
}

pub type SubscriberConstructor = Arc<dyn Fn() -> Box<dyn Subscriber> + Send + Sync>;

/// Maps the `subscribed_class` named in consumer configuration to a
/// constructor. Populated at startup.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    constructors: HashMap<String, SubscriberConstructor>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn Subscriber> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn with<F>(mut self, name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn Subscriber> + Send + Sync + 'static,
    {
        self.register(name, constructor);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<SubscriberConstructor, WarrenError> {
        self.constructors
            .get(name)
            .cloned()
            .ok_or_else(|| WarrenError::UnknownSubscriber(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayConfig, QueueConfig};
    use crate::test_handler::{BrokerEvent, TestHandler};

    struct Noop;

    #[async_trait]
    impl Subscriber for Noop {}

    struct DeadLetters;

    #[async_trait]
    impl Subscriber for DeadLetters {
        async fn process(&self, delivery: &mut Delivery) -> Result<(), ProcessError> {
            delivery.dead_letter("unprocessable").await?;
            Ok(())
        }
    }

    fn delivery(handler: &TestHandler, envelope: Envelope) -> Delivery {
        let channel = handler.channel();
        Delivery::new(
            envelope,
            Arc::new(Subscription::new(channel.clone(), QueueConfig::new("q"))),
            Arc::new(DelayExchange::new(
                channel,
                Some(DelayConfig::standard("q.delay", "q.delay", "q", 30_000)),
            )),
        )
    }

    fn published(handler: &TestHandler) -> Vec<Headers> {
        handler
            .events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Published { headers, .. } => Some(headers),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn default_processing_acks() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(3, "k", "Hello"));

        delivery.process_with(&Noop).await.unwrap();

        assert!(delivery.is_acknowledged());
        assert_eq!(handler.events(), vec![BrokerEvent::Acked(3)]);
    }

    #[tokio::test]
    async fn explicit_settlement_skips_the_automatic_ack() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(3, "k", "Hello"));

        delivery.process_with(&DeadLetters).await.unwrap();

        assert_eq!(
            handler.events(),
            vec![BrokerEvent::Nacked {
                delivery_tag: 3,
                multiple: false,
                requeue: false,
            }]
        );
    }

    #[tokio::test]
    async fn requeue_nacks_with_requeue() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(4, "k", "Hello"));

        delivery.requeue("database down").await.unwrap();

        assert_eq!(
            handler.events(),
            vec![BrokerEvent::Nacked {
                delivery_tag: 4,
                multiple: false,
                requeue: true,
            }]
        );
    }

    #[tokio::test]
    async fn second_acknowledgement_is_refused() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(5, "k", "Hello"));

        delivery.ack().await.unwrap();
        let err = delivery.dead_letter("late").await.unwrap_err();

        assert!(matches!(
            err,
            WarrenError::MultipleAcknowledgements { delivery_tag: 5, ref payload } if payload == "Hello"
        ));
        assert_eq!(handler.events(), vec![BrokerEvent::Acked(5)]);
    }

    #[tokio::test]
    async fn failed_ack_leaves_the_delivery_unsettled() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(10, "k", "Hello"));

        handler.fail_settlements(true);
        let err = delivery.ack().await.unwrap_err();
        assert!(matches!(err, WarrenError::Channel(_)));
        assert!(!delivery.is_acknowledged());

        handler.fail_settlements(false);
        delivery.dead_letter(err).await.unwrap();

        assert!(delivery.is_acknowledged());
        assert_eq!(
            handler.events(),
            vec![BrokerEvent::Nacked {
                delivery_tag: 10,
                multiple: false,
                requeue: false,
            }]
        );
    }

    #[tokio::test]
    async fn first_delay_publishes_attempt_one_and_acks() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(6, "test.k", "Hello"));
        assert_eq!(delivery.attempt(), 0);

        delivery.delay("try later").await.unwrap();

        assert_eq!(
            handler.events(),
            vec![
                BrokerEvent::Published {
                    exchange: "q.delay".into(),
                    routing_key: "test.k".into(),
                    payload: b"Hello".to_vec(),
                    headers: Headers::from([(ATTEMPTS_HEADER.to_string(), FieldValue::Int(1))]),
                },
                BrokerEvent::Acked(6),
            ]
        );
    }

    #[tokio::test]
    async fn thirtieth_delay_is_still_retried() {
        let handler = TestHandler::new();
        let mut delivery = delivery(
            &handler,
            Envelope::new(7, "k", "Hello").with_header(ATTEMPTS_HEADER, MAX_RETRIES),
        );

        delivery.delay("again").await.unwrap();

        assert_eq!(published(&handler)[0][ATTEMPTS_HEADER], FieldValue::Int(MAX_RETRIES + 1));
    }

    #[tokio::test]
    async fn delays_beyond_the_limit_dead_letter() {
        let handler = TestHandler::new();
        let mut delivery = delivery(
            &handler,
            Envelope::new(8, "k", "Hello").with_header(ATTEMPTS_HEADER, MAX_RETRIES + 1),
        );

        delivery.delay("again").await.unwrap();

        assert!(published(&handler).is_empty());
        assert_eq!(
            handler.events(),
            vec![BrokerEvent::Nacked {
                delivery_tag: 8,
                multiple: false,
                requeue: false,
            }]
        );
    }

    #[tokio::test]
    async fn delay_after_ack_publishes_nothing() {
        let handler = TestHandler::new();
        let mut delivery = delivery(&handler, Envelope::new(9, "k", "Hello"));

        delivery.ack().await.unwrap();
        assert!(delivery.delay("late").await.is_err());
        assert!(published(&handler).is_empty());
    }

    #[test]
    fn registry_resolves_registered_subscribers() {
        let registry = SubscriberRegistry::new().with("Noop", || Box::new(Noop));

        assert!(registry.resolve("Noop").is_ok());
        assert!(matches!(
            registry.resolve("Missing"),
            Err(WarrenError::UnknownSubscriber(name)) if name == "Missing"
        ));
        assert_eq!(registry.names(), vec!["Noop".to_string()]);
    }
}
