// warren-core/src/fox.rs
//! A fox is one consumer: a subscription, its delay exchange and the
//! subscriber that processes each delivery.
//!
//! ```text
//! initialized -> starting -> running <-> paused -> stopping -> stopped
//! ```
//!
//! When processing reports a [`ProcessError::TemporaryIssue`] the fox
//! unsubscribes and requeues the message, then waits for
//! [`Consumer::attempt_recovery`] to find the dependency back. Attempts back
//! off exponentially up to [`MAX_RECONNECT_DELAY`]. A consumer the broker
//! drops on its own is treated the same way.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::adaptor::FrameworkAdaptor;
use crate::channel::{ConsumerHandle, DeliveryCallback};
use crate::delay_exchange::DelayExchange;
use crate::error::{ProcessError, WarrenError};
use crate::state::{State, StateMachine};
use crate::subscriber::{Delivery, SubscriberConstructor};
use crate::subscription::Subscription;
use crate::types::Envelope;

pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5 * 60);

/// Wait before the next recovery attempt: `2^attempts` seconds, capped at
/// [`MAX_RECONNECT_DELAY`].
pub fn recovery_delay(attempts: u32) -> Duration {
    let max = MAX_RECONNECT_DELAY.as_secs();
    let secs = 2u64.checked_pow(attempts).map_or(max, |secs| secs.min(max));
    Duration::from_secs(secs)
}

/// What the [`Client`](crate::Client) drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Declares the topology and starts consuming.
    async fn run(&self) -> Result<(), WarrenError>;

    /// Cancels the subscription, waiting for the broker to confirm and for
    /// deliveries in flight to be settled.
    async fn stop(&self) -> Result<(), WarrenError>;

    /// Resubscribes a paused consumer once it is due and its dependencies
    /// have recovered. Does nothing otherwise.
    async fn attempt_recovery(&self) -> Result<(), WarrenError>;
}

struct Inner {
    machine: StateMachine,
    consumer: Option<Box<dyn ConsumerHandle>>,
    recovery_attempts: u32,
    recover_at: Instant,
}

pub struct Fox {
    name: String,
    consumer_tag: String,
    subscription: Arc<Subscription>,
    delayed: Arc<DelayExchange>,
    adaptor: Arc<dyn FrameworkAdaptor>,
    subscriber: SubscriberConstructor,
    workers: u16,
    span: Span,
    inner: Mutex<Inner>,
    this: Weak<Fox>,
}

impl Fox {
    pub fn new(
        name: &str,
        subscription: Subscription,
        delayed: DelayExchange,
        adaptor: Arc<dyn FrameworkAdaptor>,
        subscriber: SubscriberConstructor,
        workers: u16,
    ) -> Arc<Self> {
        let consumer_tag = format!("{}_{}_{}", adaptor.env(), name, std::process::id());
        let span = info_span!("fox", consumer = %consumer_tag);
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            consumer_tag,
            subscription: Arc::new(subscription),
            delayed: Arc::new(delayed),
            adaptor,
            subscriber,
            workers,
            span,
            inner: Mutex::new(Inner {
                machine: StateMachine::new(),
                consumer: None,
                recovery_attempts: 0,
                recover_at: Instant::now(),
            }),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn delayed(&self) -> &Arc<DelayExchange> {
        &self.delayed
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.machine.state()
    }

    pub async fn recovery_attempts(&self) -> u32 {
        self.inner.lock().await.recovery_attempts
    }

    pub async fn recover_at(&self) -> Instant {
        self.inner.lock().await.recover_at
    }

    /// Unsubscribes a running fox and makes it due for recovery straight
    /// away. Does nothing in any other state.
    pub async fn pause(&self) -> Result<(), WarrenError> {
        async {
            let mut inner = self.inner.lock().await;
            if !inner.machine.is_running() {
                return Ok(());
            }
            let unsubscribed = self.unsubscribe(&mut inner).await;
            inner.recovery_attempts = 0;
            inner.recover_at = Instant::now();
            inner.machine.paused();
            warn!("Paused consumer");
            unsubscribed
        }
        .instrument(self.span.clone())
        .await
    }

    async fn subscribe(&self, inner: &mut Inner) -> Result<(), WarrenError> {
        if inner.consumer.is_some() {
            return Err(WarrenError::Subscribe("Consumer already exists".into()));
        }
        let callback = Arc::new(FoxCallback {
            fox: self.this.clone(),
        });
        let consumer = self
            .subscription
            .subscribe(&self.consumer_tag, self.workers, callback)
            .await?;
        inner.consumer = Some(consumer);
        Ok(())
    }

    async fn unsubscribe(&self, inner: &mut Inner) -> Result<(), WarrenError> {
        if let Some(consumer) = inner.consumer.take() {
            info!("Unsubscribing");
            consumer.cancel().await?;
            info!("Unsubscribed");
        }
        Ok(())
    }

    /// The broker ended the subscription without being asked to. A running
    /// fox pauses so the control loop resubscribes it.
    async fn consumer_lost(&self) {
        async {
            let mut inner = self.inner.lock().await;
            if !inner.machine.is_running() {
                return;
            }
            inner.consumer = None;
            inner.recovery_attempts = 0;
            inner.recover_at = Instant::now();
            inner.machine.paused();
            warn!("Consumer cancelled by broker");
        }
        .instrument(self.span.clone())
        .await
    }

    fn back_off(inner: &mut Inner) {
        inner.recovery_attempts = inner.recovery_attempts.saturating_add(1);
        let delay = recovery_delay(inner.recovery_attempts);
        inner.recover_at = Instant::now() + delay;
        warn!(
            attempts = inner.recovery_attempts,
            retry_in_secs = delay.as_secs(),
            "Recovery failed"
        );
    }

    /// Runs one delivery through a fresh subscriber. Temporary issues pause
    /// the fox and requeue the message; any other failure, panics included,
    /// dead-letters it.
    async fn process(&self, envelope: Envelope) -> Result<(), WarrenError> {
        debug!(delivery_tag = envelope.delivery_tag, "Started message process");
        let mut delivery = Delivery::new(envelope, self.subscription.clone(), self.delayed.clone());
        let subscriber = (self.subscriber)();

        let work = self
            .adaptor
            .handle(Box::pin(delivery.process_with(subscriber.as_ref())));
        let caught = AssertUnwindSafe(work).catch_unwind().await;
        let outcome = match caught {
            Ok(outcome) => outcome,
            Err(panic) if delivery.is_acknowledged() => {
                error!(reason = panic_message(&*panic), "Subscriber panicked after settling");
                Ok(())
            }
            Err(panic) => Err(ProcessError::failed(format!(
                "subscriber panicked: {}",
                panic_message(&*panic)
            ))),
        };

        let settled = match outcome {
            Ok(()) => Ok(()),
            Err(ProcessError::TemporaryIssue(reason)) => {
                warn!(%reason, "Temporary Issue");
                if let Err(err) = self.pause().await {
                    error!(error = %err, "failed to pause consumer");
                }
                delivery.requeue(reason).await
            }
            Err(ProcessError::Warren(err @ WarrenError::MultipleAcknowledgements { .. })) => Err(err),
            Err(err) => delivery.dead_letter(err).await,
        };
        debug!("Finished message process");
        settled
    }
}

#[async_trait]
impl Consumer for Fox {
    async fn run(&self) -> Result<(), WarrenError> {
        async {
            let mut inner = self.inner.lock().await;
            inner.machine.starting();
            self.subscription.activate().await?;
            self.delayed.activate().await?;
            inner.machine.running();
            self.subscribe(&mut inner).await?;
            info!("Started consumer");
            Ok::<(), WarrenError>(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn stop(&self) -> Result<(), WarrenError> {
        async {
            info!("Stopping consumer");
            // The lock is released while draining: a delivery still in
            // flight may need it to pause.
            let consumer = {
                let mut inner = self.inner.lock().await;
                inner.machine.stopping();
                inner.consumer.take()
            };
            if let Some(consumer) = consumer {
                info!("Unsubscribing");
                consumer.cancel().await?;
                consumer.drain().await;
                info!("Unsubscribed");
            }
            self.inner.lock().await.machine.stopped();
            info!("Stopped consumer");
            Ok::<(), WarrenError>(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn attempt_recovery(&self) -> Result<(), WarrenError> {
        async {
            let mut inner = self.inner.lock().await;
            if !inner.machine.is_paused() || Instant::now() < inner.recover_at {
                return Ok(());
            }

            warn!(attempts = inner.recovery_attempts, "Attempting recovery");
            if !self.adaptor.recovered().await {
                Self::back_off(&mut inner);
                return Ok(());
            }

            inner.machine.running();
            if let Err(err) = self.subscribe(&mut inner).await {
                inner.machine.paused();
                Self::back_off(&mut inner);
                return Err(err);
            }
            info!("Recovered consumer");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

struct FoxCallback {
    fox: Weak<Fox>,
}

#[async_trait]
impl DeliveryCallback for FoxCallback {
    async fn on_delivery(&self, envelope: Envelope) {
        let Some(fox) = self.fox.upgrade() else {
            return;
        };
        let delivery_tag = envelope.delivery_tag;
        let span = fox.span.clone();
        async {
            if let Err(err) = fox.process(envelope).await {
                error!(delivery_tag, error = %err, "failed to settle delivery");
            }
        }
        .instrument(span)
        .await
    }

    async fn on_cancelled(&self) {
        if let Some(fox) = self.fox.upgrade() {
            fox.consumer_lost().await;
        }
    }
}
