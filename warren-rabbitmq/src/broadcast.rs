use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{Connection, ConnectionProperties};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use warren_core::channel::BrokerChannel;
use warren_core::config::{ExchangeConfig, ExchangeKind};
use warren_core::handler::Handler;
use warren_core::pool::{ChannelFactory, ChannelLease, ChannelPool};
use warren_core::routing::RoutingKeyTemplate;
use warren_core::types::Message;
use warren_core::WarrenError;

use crate::channel::AmqpChannel;
use crate::options::RabbitMqOptions;

struct ConnState {
    connection: Arc<Connection>,
    pool: Arc<ChannelPool>,
}

impl ConnState {
    fn live(&self) -> Option<(Arc<Connection>, Arc<ChannelPool>)> {
        self.connection
            .status()
            .connected()
            .then(|| (Arc::clone(&self.connection), Arc::clone(&self.pool)))
    }
}

/// Publishes to and consumes from RabbitMQ over one connection, with a pool
/// of channels for publishing.
pub struct Broadcast {
    opts: RabbitMqOptions,
    template: RoutingKeyTemplate,
    state: RwLock<Option<ConnState>>,
    connections_opened: AtomicUsize,
}

impl Broadcast {
    /// Does not connect until first use or [`Handler::connect`].
    pub fn new(opts: RabbitMqOptions) -> Self {
        Self {
            template: RoutingKeyTemplate::new(opts.routing_key_prefix.as_deref()),
            opts,
            state: RwLock::new(None),
            connections_opened: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.opts
    }

    /// Connections opened so far, reconnects included.
    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::Relaxed)
    }

    fn channel_factory(&self, connection: Arc<Connection>) -> ChannelFactory {
        let template = self.template.clone();
        let confirms = self.opts.confirms;
        Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn BrokerChannel>, WarrenError>> {
            let connection = Arc::clone(&connection);
            let template = template.clone();
            Box::pin(async move {
                let channel = AmqpChannel::open(&connection, template, confirms).await?;
                Ok(Arc::new(channel) as Arc<dyn BrokerChannel>)
            })
        })
    }

    /// Opens a connection and its pool. The publish exchange is declared
    /// here, once per connection.
    async fn open(&self) -> Result<ConnState, WarrenError> {
        let connection = Connection::connect(&self.opts.uri, ConnectionProperties::default())
            .await
            .map_err(|e| WarrenError::Connection(e.to_string()))?;
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(connection);
        let pool = Arc::new(ChannelPool::new(
            self.opts.pool_size,
            self.opts.checkout_timeout,
            self.channel_factory(Arc::clone(&connection)),
        ));

        if let Some(exchange) = &self.opts.exchange {
            let mut config = ExchangeConfig::new(exchange.as_str(), ExchangeKind::Topic);
            config.options.durable = self.opts.durable;
            pool.checkout().await?.declare_exchange(&config).await?;
        }

        info!(exchange = ?self.opts.exchange, "RabbitMQ connected");
        Ok(ConnState { connection, pool })
    }

    /// The live connection, opening one if there is none. Callers racing
    /// here share a single new connection.
    async fn current(&self) -> Result<(Arc<Connection>, Arc<ChannelPool>), WarrenError> {
        if let Some(current) = self.state.read().await.as_ref().and_then(ConnState::live) {
            return Ok(current);
        }

        let mut state = self.state.write().await;
        if let Some(current) = state.as_ref().and_then(ConnState::live) {
            return Ok(current);
        }
        if let Some(stale) = state.take() {
            warn!("RabbitMQ connection lost, reconnecting");
            stale.pool.drain().await;
        }
        let fresh = self.open().await?;
        let current = (Arc::clone(&fresh.connection), Arc::clone(&fresh.pool));
        *state = Some(fresh);
        Ok(current)
    }

    async fn reset(&self) -> Result<(), WarrenError> {
        let Some(state) = self.state.write().await.take() else {
            return Ok(());
        };
        state.pool.drain().await;
        if !state.connection.status().connected() {
            return Ok(());
        }
        state
            .connection
            .close(200, "OK")
            .await
            .map_err(|e| WarrenError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Handler for Broadcast {
    /// Drops any existing connection and opens a new one. Needed in a child
    /// process after fork, where the parent's sockets are unusable.
    async fn connect(&self) -> Result<(), WarrenError> {
        if let Err(err) = self.reset().await {
            warn!(error = %err, "failed to close previous connection");
        }
        self.current().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), WarrenError> {
        self.reset().await?;
        info!("RabbitMQ disconnected");
        Ok(())
    }

    async fn checkout(&self) -> Result<ChannelLease, WarrenError> {
        let (_, pool) = self.current().await?;
        pool.checkout().await
    }

    async fn new_channel(&self) -> Result<Arc<dyn BrokerChannel>, WarrenError> {
        let (connection, _) = self.current().await?;
        let channel = AmqpChannel::open(&connection, self.template.clone(), self.opts.confirms).await?;
        Ok(Arc::new(channel))
    }

    async fn publish(&self, message: &dyn Message) -> Result<(), WarrenError> {
        let exchange = self
            .opts
            .exchange
            .as_deref()
            .ok_or_else(|| WarrenError::Configuration("No exchange configured".into()))?;
        let routing_key = self.template.key_for(message.routing_key());
        let channel = self.checkout().await?;
        channel
            .publish(exchange, &routing_key, message.payload(), &message.headers())
            .await
    }
}
