// warren-core/src/adaptor.rs
//! Hooks into the application hosting the consumers.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

use crate::error::{ProcessError, WarrenError};

/// Processing of one delivery, handed to [`FrameworkAdaptor::handle`].
pub type Work<'a> = BoxFuture<'a, Result<(), ProcessError>>;

#[async_trait]
pub trait FrameworkAdaptor: Send + Sync {
    /// Whether the dependencies a paused consumer was waiting on are back.
    async fn recovered(&self) -> bool;

    /// Runs `work`. Implementations report a failure caused by an outage as
    /// [`ProcessError::TemporaryIssue`] so the consumer pauses.
    async fn handle(&self, work: Work<'_>) -> Result<(), ProcessError> {
        work.await
    }

    fn env(&self) -> &str;

    /// Bootstraps the application before any consumer starts.
    async fn load_application(&self) -> Result<(), WarrenError> {
        Ok(())
    }
}

/// Adaptor for applications without external dependencies to watch.
#[derive(Debug, Clone)]
pub struct DefaultAdaptor {
    env: String,
}

impl DefaultAdaptor {
    pub fn new(env: impl Into<String>) -> Self {
        Self { env: env.into() }
    }
}

#[async_trait]
impl FrameworkAdaptor for DefaultAdaptor {
    async fn recovered(&self) -> bool {
        true
    }

    fn env(&self) -> &str {
        &self.env
    }
}

pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Watches a dependency through a health probe, such as a database ping.
/// Failures that happen while the probe reports the dependency down are
/// treated as temporary.
#[derive(Clone)]
pub struct ProbeAdaptor {
    env: String,
    probe: Probe,
}

impl ProbeAdaptor {
    pub fn new<F, Fut>(env: impl Into<String>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self {
            env: env.into(),
            probe: Arc::new(move || -> BoxFuture<'static, bool> { Box::pin(probe()) }),
        }
    }
}

#[async_trait]
impl FrameworkAdaptor for ProbeAdaptor {
    async fn recovered(&self) -> bool {
        (self.probe)().await
    }

    async fn handle(&self, work: Work<'_>) -> Result<(), ProcessError> {
        let result = work.await;
        if let Err(err) = &result {
            if !err.is_temporary() && !(self.probe)().await {
                warn!(error = %err, "dependency unavailable, treating failure as temporary");
                return Err(ProcessError::TemporaryIssue(err.to_string()));
            }
        }
        result
    }

    fn env(&self) -> &str {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn probe(up: &Arc<AtomicBool>) -> ProbeAdaptor {
        let up = Arc::clone(up);
        ProbeAdaptor::new("test", move || {
            let up = up.load(Ordering::SeqCst);
            async move { up }
        })
    }

    #[tokio::test]
    async fn default_adaptor_is_always_recovered() {
        let adaptor = DefaultAdaptor::new("development");
        assert!(adaptor.recovered().await);
        assert_eq!(adaptor.env(), "development");
        assert!(adaptor.handle(Box::pin(async { Ok::<(), ProcessError>(()) })).await.is_ok());
    }

    #[tokio::test]
    async fn failures_during_an_outage_become_temporary() {
        let up = Arc::new(AtomicBool::new(false));
        let adaptor = probe(&up);

        let result = adaptor
            .handle(Box::pin(async { Err::<(), _>(ProcessError::failed("connection refused")) }))
            .await;
        assert!(result.unwrap_err().is_temporary());
        assert!(!adaptor.recovered().await);
    }

    #[tokio::test]
    async fn failures_with_a_healthy_dependency_are_kept() {
        let up = Arc::new(AtomicBool::new(true));
        let adaptor = probe(&up);

        let result = adaptor
            .handle(Box::pin(async { Err::<(), _>(ProcessError::failed("bad payload")) }))
            .await;
        assert!(matches!(result, Err(ProcessError::Failed(_))));
        assert!(adaptor.recovered().await);
    }
}
