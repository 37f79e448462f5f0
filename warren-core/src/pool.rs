//! Bounded pool of broker channels.
//!
//! One physical connection multiplexes many channels, but a channel must not
//! be used by two tasks at once. The pool hands each channel to a single
//! borrower at a time and takes it back when the [`ChannelLease`] drops,
//! whether the borrower succeeded, failed or panicked.

use futures_util::future::BoxFuture;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::channel::BrokerChannel;
use crate::WarrenError;

pub const DEFAULT_POOL_SIZE: usize = crate::settings::DEFAULT_POOL_SIZE;
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

pub type ChannelFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn BrokerChannel>, WarrenError>> + Send + Sync>;

struct Shared {
    idle: Mutex<Vec<Arc<dyn BrokerChannel>>>,
    closed: AtomicBool,
}

impl Shared {
    fn take_idle(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(channel) = idle.pop() {
            if channel.is_open() {
                return Some(channel);
            }
            debug!("discarding closed pooled channel");
        }
        None
    }

    fn give_back(&self, channel: Arc<dyn BrokerChannel>) {
        if self.closed.load(Ordering::Acquire) || !channel.is_open() {
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(channel);
    }
}

pub struct ChannelPool {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    size: usize,
    timeout: Duration,
    factory: ChannelFactory,
}

impl ChannelPool {
    pub fn new(size: usize, timeout: Duration, factory: ChannelFactory) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(Vec::with_capacity(size)),
                closed: AtomicBool::new(false),
            }),
            permits: Arc::new(Semaphore::new(size)),
            size,
            timeout,
            factory,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.shared
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Borrows a channel, opening one if none is idle. Waits at most the
    /// pool timeout for a free slot and fails with
    /// [`WarrenError::PoolTimeout`] after that.
    pub async fn checkout(&self) -> Result<ChannelLease, WarrenError> {
        let permit = tokio::time::timeout(self.timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| WarrenError::PoolTimeout(self.timeout))?
            .map_err(|_| WarrenError::Channel("channel pool has been drained".into()))?;

        let channel = match self.shared.take_idle() {
            Some(channel) => channel,
            None => (self.factory)().await?,
        };

        Ok(ChannelLease {
            channel,
            pool: Some(Arc::clone(&self.shared)),
            _permit: Some(permit),
        })
    }

    /// Closes every idle channel and refuses further checkouts. Channels
    /// still on loan are dropped when they come back.
    pub async fn drain(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.permits.close();
        let idle: Vec<_> = std::mem::take(
            &mut *self
                .shared
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for channel in idle {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "failed to close pooled channel");
            }
        }
    }
}

/// A borrowed channel, returned to its pool on drop.
pub struct ChannelLease {
    channel: Arc<dyn BrokerChannel>,
    pool: Option<Arc<Shared>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ChannelLease {
    /// A lease that belongs to no pool.
    pub fn detached(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            pool: None,
            _permit: None,
        }
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&self.channel)
    }
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(Arc::clone(&self.channel));
        }
    }
}
