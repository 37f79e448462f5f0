// warren-core/src/handler.rs
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::channel::BrokerChannel;
use crate::pool::ChannelLease;
use crate::types::Message;
use crate::WarrenError;

/// Process-wide broker handle. Built once at startup and passed to whatever
/// needs to publish or consume.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Resets and reopens the underlying connection.
    async fn connect(&self) -> Result<(), WarrenError>;

    /// Closes the connection and drains the channel pool.
    async fn disconnect(&self) -> Result<(), WarrenError>;

    /// Borrows a pooled channel.
    async fn checkout(&self) -> Result<ChannelLease, WarrenError>;

    /// Opens a channel outside the pool. Consumers own theirs for life.
    async fn new_channel(&self) -> Result<Arc<dyn BrokerChannel>, WarrenError>;

    /// Publishes under the configured exchange and prefixed routing key.
    async fn publish(&self, message: &dyn Message) -> Result<(), WarrenError>;
}

/// Runs `f` with a pooled channel, returning the channel whatever the
/// outcome.
pub async fn with_channel<T, F, Fut>(handler: &dyn Handler, f: F) -> Result<T, WarrenError>
where
    F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
    Fut: Future<Output = Result<T, WarrenError>>,
{
    let lease = handler.checkout().await?;
    f(lease.channel()).await
}
