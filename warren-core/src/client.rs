// warren-core/src/client.rs
//! Process-level orchestration of consumers.
//!
//! Signal handlers only flip the client into `stopping` and wake the control
//! loop. Unsubscribing, recovery and shutdown all happen on the loop, which
//! otherwise ticks every [`POLL_INTERVAL`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adaptor::FrameworkAdaptor;
use crate::den::Spawner;
use crate::fox::Consumer;
use crate::handler::Handler;
use crate::state::{State, StateMachine};
use crate::WarrenError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct Client {
    spawner: Arc<dyn Spawner>,
    handler: Arc<dyn Handler>,
    adaptor: Arc<dyn FrameworkAdaptor>,
    requested: Vec<String>,
    machine: Mutex<StateMachine>,
    wake: Notify,
    poll_interval: Duration,
    trap_signals: bool,
}

impl Client {
    pub fn new(spawner: Arc<dyn Spawner>, handler: Arc<dyn Handler>, adaptor: Arc<dyn FrameworkAdaptor>) -> Self {
        Self {
            spawner,
            handler,
            adaptor,
            requested: Vec::new(),
            machine: Mutex::new(StateMachine::new()),
            wake: Notify::new(),
            poll_interval: POLL_INTERVAL,
            trap_signals: true,
        }
    }

    /// Runs only the named consumers. Without names every configured
    /// consumer runs.
    pub fn with_consumers(mut self, consumers: Vec<String>) -> Self {
        self.requested = consumers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Leaves SIGTERM and Ctrl-C alone, for embedding and tests.
    pub fn without_signal_handlers(mut self) -> Self {
        self.trap_signals = false;
        self
    }

    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> State {
        self.machine().state()
    }

    pub fn is_alive(&self) -> bool {
        !self.machine().is_stopped()
    }

    /// Asks the control loop to stop every consumer. Safe to call from a
    /// signal handler task.
    pub fn stop(&self) {
        {
            let mut machine = self.machine();
            if machine.is_stopped() {
                return;
            }
            machine.stopping();
        }
        info!("Stopping consumers");
        self.wake.notify_one();
    }

    /// Ctrl-C: the first press stops gracefully, the second exits at once.
    fn manual_stop(&self) {
        if self.machine().is_stopping() {
            warn!("Stopping immediately");
            std::process::exit(1);
        }
        self.stop();
        info!("Press Ctrl-C again to stop immediately.");
    }

    /// Starts the requested consumers and supervises them until stopped.
    pub async fn run(self: &Arc<Self>) -> Result<(), WarrenError> {
        self.machine().starting();
        self.adaptor.load_application().await?;
        self.handler.connect().await?;

        let signals = if self.trap_signals {
            self.install_signal_handlers()
        } else {
            Vec::new()
        };
        let supervised = self.supervise().await;
        for task in signals {
            task.abort();
        }

        let disconnected = self.handler.disconnect().await;
        supervised?;
        disconnected
    }

    async fn supervise(&self) -> Result<(), WarrenError> {
        let names = if self.requested.is_empty() {
            self.spawner.consumer_names()
        } else {
            self.requested.clone()
        };

        let mut foxes = Vec::with_capacity(names.len());
        for name in &names {
            let fox = self.spawner.spawn(name).await?;
            fox.run().await?;
            foxes.push(fox);
        }
        {
            let mut machine = self.machine();
            if machine.is_starting() {
                machine.started();
            }
        }
        info!(consumers = ?names, "Started client");

        while self.is_alive() {
            self.control_loop(&foxes).await;
        }
        Ok(())
    }

    async fn control_loop(&self, foxes: &[Arc<dyn Consumer>]) {
        if self.machine().is_stopping() {
            for fox in foxes {
                if let Err(err) = fox.stop().await {
                    error!(error = %err, "failed to stop consumer");
                }
            }
            self.machine().stopped();
            info!("Stopped consumers");
            return;
        }

        for fox in foxes {
            if let Err(err) = fox.attempt_recovery().await {
                error!(error = %err, "recovery attempt failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.wake.notified() => {}
        }
    }

    fn install_signal_handlers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "cannot listen for Ctrl-C");
                    return;
                }
                client.manual_stop();
            }
        }));

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let client = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut terminate) => {
                        while terminate.recv().await.is_some() {
                            client.stop();
                        }
                    }
                    Err(err) => warn!(error = %err, "cannot listen for SIGTERM"),
                }
            }));
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::DefaultAdaptor;
    use crate::fox::MockConsumer;
    use crate::test_handler::TestHandler;
    use async_trait::async_trait;

    struct FakeSpawner {
        consumers: Mutex<Vec<MockConsumer>>,
        spawned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        async fn spawn(&self, name: &str) -> Result<Arc<dyn Consumer>, WarrenError> {
            self.spawned.lock().unwrap().push(name.to_string());
            let consumer = self
                .consumers
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| WarrenError::UnknownConsumer(name.to_string()))?;
            Ok(Arc::new(consumer))
        }

        fn consumer_names(&self) -> Vec<String> {
            vec!["a".into(), "b".into(), "c".into()]
        }
    }

    fn mock(recoveries: usize) -> MockConsumer {
        let mut consumer = MockConsumer::new();
        consumer.expect_run().times(1).returning(|| Ok(()));
        consumer
            .expect_attempt_recovery()
            .times(recoveries)
            .returning(|| Ok(()));
        consumer.expect_stop().times(1).returning(|| Ok(()));
        consumer
    }

    fn client(spawner: Arc<FakeSpawner>) -> Arc<Client> {
        Arc::new(
            Client::new(
                spawner,
                Arc::new(TestHandler::new()),
                Arc::new(DefaultAdaptor::new("test")),
            )
            .with_consumers(vec!["a".into(), "b".into()])
            .without_signal_handlers(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn runs_requested_consumers_until_stopped() {
        let spawner = Arc::new(FakeSpawner {
            consumers: Mutex::new(vec![mock(3), mock(3)]),
            spawned: Mutex::new(Vec::new()),
        });
        let client = client(Arc::clone(&spawner));

        let running = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });

        // Ticks at 0s, 3s and 6s, then the stop at 7s wakes the loop early.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(client.state(), State::Started);
        client.stop();

        running.await.unwrap().unwrap();
        assert_eq!(client.state(), State::Stopped);
        assert!(!client.is_alive());
        assert_eq!(*spawner.spawned.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stopping_a_stopped_client_changes_nothing() {
        let client = client(Arc::new(FakeSpawner {
            consumers: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        }));
        assert!(client.is_alive());

        client.machine().stopped();
        client.stop();

        assert_eq!(client.state(), State::Stopped);
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn spawn_failures_abort_the_run() {
        let spawner = Arc::new(FakeSpawner {
            consumers: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        });
        let client = client(spawner);

        let err = client.run().await.unwrap_err();
        assert!(matches!(err, WarrenError::UnknownConsumer(name) if name == "a"));
    }
}
