// warren-core/src/den.rs
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::adaptor::FrameworkAdaptor;
use crate::config::Consumers;
use crate::delay_exchange::DelayExchange;
use crate::fox::{Consumer, Fox};
use crate::handler::{with_channel, Handler};
use crate::subscriber::SubscriberRegistry;
use crate::subscription::Subscription;
use crate::WarrenError;

/// Builds the fox for one configured consumer, once.
pub struct Den {
    name: String,
    consumers: Arc<Consumers>,
    handler: Arc<dyn Handler>,
    adaptor: Arc<dyn FrameworkAdaptor>,
    registry: Arc<SubscriberRegistry>,
    fox: OnceCell<Arc<Fox>>,
}

impl Den {
    pub fn new(
        name: impl Into<String>,
        consumers: Arc<Consumers>,
        handler: Arc<dyn Handler>,
        adaptor: Arc<dyn FrameworkAdaptor>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            consumers,
            handler,
            adaptor,
            registry,
            fox: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The consumer's fox, on a channel of its own. Built on first call.
    pub async fn fox(&self) -> Result<Arc<Fox>, WarrenError> {
        self.fox
            .get_or_try_init(|| self.build())
            .await
            .map(Arc::clone)
    }

    async fn build(&self) -> Result<Arc<Fox>, WarrenError> {
        let config = self.consumers.consumer(&self.name)?;
        let subscriber = self.registry.resolve(&config.subscribed_class)?;

        let channel = self.handler.new_channel().await?;
        let subscription = Subscription::new(Arc::clone(&channel), config.queue.clone());
        let delayed = DelayExchange::new(channel, config.delay.clone());

        Ok(Fox::new(
            &self.name,
            subscription,
            delayed,
            Arc::clone(&self.adaptor),
            subscriber,
            config.worker_count,
        ))
    }

    /// Declares the dead-letter queue and its bindings without consuming
    /// from it, so rejected messages have somewhere to go from the start.
    pub async fn register_dead_letter_queues(&self) -> Result<(), WarrenError> {
        let config = self.consumers.consumer(&self.name)?;
        let Some(dead_letters) = config.dead_letters.clone() else {
            return Ok(());
        };
        info!(consumer = %self.name, queue = ?dead_letters.name, "Registering dead-letter queue");
        with_channel(self.handler.as_ref(), |channel| async move {
            Subscription::new(channel, dead_letters).activate().await
        })
        .await
    }
}

/// Produces the consumers a [`Client`](crate::Client) runs.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, name: &str) -> Result<Arc<dyn Consumer>, WarrenError>;

    /// Everything that can be spawned, for when no consumer is requested.
    fn consumer_names(&self) -> Vec<String>;
}

/// Spawns foxes from a consumer configuration store.
pub struct DenSpawner {
    consumers: Arc<Consumers>,
    handler: Arc<dyn Handler>,
    adaptor: Arc<dyn FrameworkAdaptor>,
    registry: Arc<SubscriberRegistry>,
}

impl DenSpawner {
    pub fn new(
        consumers: Arc<Consumers>,
        handler: Arc<dyn Handler>,
        adaptor: Arc<dyn FrameworkAdaptor>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            consumers,
            handler,
            adaptor,
            registry,
        }
    }

    pub fn den(&self, name: &str) -> Den {
        Den::new(
            name,
            Arc::clone(&self.consumers),
            Arc::clone(&self.handler),
            Arc::clone(&self.adaptor),
            Arc::clone(&self.registry),
        )
    }
}

#[async_trait]
impl Spawner for DenSpawner {
    async fn spawn(&self, name: &str) -> Result<Arc<dyn Consumer>, WarrenError> {
        let den = self.den(name);
        den.register_dead_letter_queues().await?;
        let fox: Arc<dyn Consumer> = den.fox().await?;
        Ok(fox)
    }

    fn consumer_names(&self) -> Vec<String> {
        self.consumers.all_consumers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::DefaultAdaptor;
    use crate::config::{ConsumerConfig, DelayConfig, ExchangeConfig, ExchangeKind, BindingOptions, QueueConfig};
    use crate::state::State;
    use crate::subscriber::Subscriber;
    use crate::test_handler::{BrokerEvent, TestHandler};

    struct Noop;

    #[async_trait]
    impl Subscriber for Noop {}

    fn consumers() -> Arc<Consumers> {
        let mut consumers = Consumers::default();
        consumers.insert(
            "q",
            ConsumerConfig {
                desc: "test consumer".into(),
                queue: QueueConfig::new("q"),
                dead_letters: Some(QueueConfig::new("q.dead-letters").bind(
                    ExchangeConfig::new("q.dead-letters", ExchangeKind::Fanout),
                    BindingOptions::default(),
                )),
                delay: Some(DelayConfig::standard("q.delay", "q.delay", "q", 30_000)),
                subscribed_class: "Noop".into(),
                worker_count: 2,
            },
        );
        consumers.insert(
            "orphan",
            ConsumerConfig {
                desc: String::new(),
                queue: QueueConfig::new("orphan"),
                dead_letters: None,
                delay: None,
                subscribed_class: "Missing".into(),
                worker_count: 1,
            },
        );
        Arc::new(consumers)
    }

    fn spawner(handler: &TestHandler) -> DenSpawner {
        DenSpawner::new(
            consumers(),
            Arc::new(handler.clone()),
            Arc::new(DefaultAdaptor::new("test")),
            Arc::new(SubscriberRegistry::new().with("Noop", || Box::new(Noop))),
        )
    }

    #[tokio::test]
    async fn fox_is_built_once_on_a_dedicated_channel() {
        let handler = TestHandler::new();
        let den = spawner(&handler).den("q");

        let first = den.fox().await.unwrap();
        let second = den.fox().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(handler.channels_opened(), 1);
        assert_eq!(first.name(), "q");
        assert!(first.delayed().is_configured());
        assert_eq!(first.state().await, State::Initialized);
    }

    #[tokio::test]
    async fn unknown_consumers_and_subscribers_are_errors() {
        let handler = TestHandler::new();
        let spawner = spawner(&handler);

        assert!(matches!(
            spawner.den("nope").fox().await,
            Err(WarrenError::UnknownConsumer(_))
        ));
        assert!(matches!(
            spawner.den("orphan").fox().await,
            Err(WarrenError::UnknownSubscriber(name)) if name == "Missing"
        ));
        assert_eq!(handler.channels_opened(), 0);
    }

    #[tokio::test]
    async fn dead_letter_queues_are_declared_without_consuming() {
        let handler = TestHandler::new();
        let den = spawner(&handler).den("q");

        den.register_dead_letter_queues().await.unwrap();

        assert_eq!(
            handler.events(),
            vec![
                BrokerEvent::QueueDeclared("q.dead-letters".into()),
                BrokerEvent::ExchangeDeclared("q.dead-letters".into()),
                BrokerEvent::QueueBound {
                    queue: "q.dead-letters".into(),
                    exchange: "q.dead-letters".into(),
                    routing_key: None,
                },
            ]
        );
        assert!(!handler.is_consuming("q.dead-letters"));
    }

    #[tokio::test]
    async fn spawning_registers_dead_letters_first() {
        let handler = TestHandler::new();
        let spawner = spawner(&handler);

        spawner.spawn("q").await.unwrap();

        assert_eq!(handler.events()[0], BrokerEvent::QueueDeclared("q.dead-letters".into()));
        assert_eq!(spawner.consumer_names(), vec!["orphan".to_string(), "q".to_string()]);
    }
}
