// warren-core/src/delay_exchange.rs
//! Delayed retry through TTL dead-lettering.
//!
//! Messages are published to a fanout exchange bound to a queue that nobody
//! consumes. When their TTL expires the broker dead-letters them, through the
//! default exchange, back onto the original queue with their headers intact.

use std::sync::Arc;
use tracing::debug;

use crate::channel::BrokerChannel;
use crate::config::{DelayConfig, ExchangeConfig};
use crate::types::Headers;
use crate::WarrenError;

pub struct DelayExchange {
    channel: Arc<dyn BrokerChannel>,
    config: Option<DelayConfig>,
}

impl DelayExchange {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: Option<DelayConfig>) -> Self {
        Self { channel, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.as_ref().is_some_and(DelayConfig::is_configured)
    }

    /// Declares the exchange, the delay queues and their bindings. Does
    /// nothing when no delay is configured.
    pub async fn activate(&self) -> Result<(), WarrenError> {
        let Some((exchange, config)) = self.configured() else {
            return Ok(());
        };
        self.channel.declare_exchange(exchange).await?;

        let template = self.channel.routing_key_template();
        for binding in &config.bindings {
            let queue = binding
                .queue
                .name
                .as_deref()
                .ok_or_else(|| WarrenError::Configuration("No delay queue configured".into()))?;
            self.channel.declare_queue(queue, &binding.queue.options).await?;
            self.channel
                .bind_queue(queue, &exchange.name, &binding.options.expand(template))
                .await?;
        }
        Ok(())
    }

    /// Publishes `payload` to the delay exchange under `routing_key`, as is.
    pub async fn publish(&self, payload: &[u8], routing_key: &str, headers: &Headers) -> Result<(), WarrenError> {
        let (exchange, _) = self
            .configured()
            .ok_or_else(|| WarrenError::Configuration("No delay queue configured".into()))?;
        debug!(exchange = %exchange.name, routing_key, ?headers, "delaying message");
        self.channel
            .publish(&exchange.name, routing_key, payload, headers)
            .await
    }

    fn configured(&self) -> Option<(&ExchangeConfig, &DelayConfig)> {
        let config = self.config.as_ref()?;
        Some((config.exchange.as_ref()?, config))
    }
}
