//! Execution backend abstraction.
//!
//! The bus and the task worker pool never spawn or log on their own; they
//! go through a [`Backend`], which supplies an [`Executor`] plus optional
//! logging and metrics sinks. Two implementations are provided:
//! [`StandaloneBackend`] runs on the ambient tokio runtime with a tracing
//! logger, [`IntegratedBackend`] delegates every concern to injected
//! collaborators.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BusError, BusResult};

/// Severity for [`LogSink`] records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Unit-of-work executor. Owns its threads (or runtime); implementations
/// must be thread-safe.
pub trait Executor: Send + Sync {
    fn spawn(&self, work: BoxFuture<'static, ()>);
}

/// Optional log sink for handler-facing log forwarding
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, target: &str, message: &str);
}

/// Optional metrics sink
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
}

/// Execution backend consumed by bus and worker pool.
///
/// `logger()` and `monitoring()` may return `None`; callers handle absence
/// silently.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn initialize(&self) -> BusResult<()>;
    async fn shutdown(&self) -> BusResult<()>;
    fn executor(&self) -> Arc<dyn Executor>;
    fn logger(&self) -> Option<Arc<dyn LogSink>>;
    fn monitoring(&self) -> Option<Arc<dyn MetricsSink>>;
    fn is_ready(&self) -> bool;
}

/// Executor spawning onto the ambient tokio runtime
#[derive(Debug, Default, Clone)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn spawn(&self, work: BoxFuture<'static, ()>) {
        tokio::spawn(work);
    }
}

/// Log sink forwarding to `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, target: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target = %target, "{message}"),
            LogLevel::Info => tracing::info!(target = %target, "{message}"),
            LogLevel::Warn => tracing::warn!(target = %target, "{message}"),
            LogLevel::Error => tracing::error!(target = %target, "{message}"),
        }
    }
}

/// Self-contained backend: tokio executor, tracing logger, no metrics.
pub struct StandaloneBackend {
    executor: Arc<dyn Executor>,
    logger: Arc<dyn LogSink>,
    ready: AtomicBool,
}

impl StandaloneBackend {
    pub fn new() -> Self {
        Self {
            executor: Arc::new(TokioExecutor),
            logger: Arc::new(TracingLogSink),
            ready: AtomicBool::new(false),
        }
    }
}

impl Default for StandaloneBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for StandaloneBackend {
    async fn initialize(&self) -> BusResult<()> {
        self.ready.store(true, Ordering::SeqCst);
        tracing::debug!("Standalone backend initialized");
        Ok(())
    }

    async fn shutdown(&self) -> BusResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        tracing::debug!("Standalone backend shut down");
        Ok(())
    }

    fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    fn logger(&self) -> Option<Arc<dyn LogSink>> {
        Some(self.logger.clone())
    }

    fn monitoring(&self) -> Option<Arc<dyn MetricsSink>> {
        None
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Backend delegating to externally supplied collaborators.
pub struct IntegratedBackend {
    executor: Arc<dyn Executor>,
    logger: Option<Arc<dyn LogSink>>,
    monitoring: Option<Arc<dyn MetricsSink>>,
    ready: AtomicBool,
}

impl IntegratedBackend {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            logger: None,
            monitoring: None,
            ready: AtomicBool::new(false),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<dyn MetricsSink>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }
}

#[async_trait]
impl Backend for IntegratedBackend {
    async fn initialize(&self) -> BusResult<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> BusResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    fn logger(&self) -> Option<Arc<dyn LogSink>> {
        self.logger.clone()
    }

    fn monitoring(&self) -> Option<Arc<dyn MetricsSink>> {
        self.monitoring.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Backend selection for system-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Standalone,
    Integrated,
}

impl BackendKind {
    /// Read the kind from the `HERMOD_BACKEND` environment variable.
    ///
    /// Unset defaults to `Standalone`.
    pub fn from_env() -> BusResult<Self> {
        match std::env::var("HERMOD_BACKEND") {
            Err(_) => Ok(Self::Standalone),
            Ok(v) => match v.to_lowercase().as_str() {
                "standalone" => Ok(Self::Standalone),
                "integrated" => Ok(Self::Integrated),
                other => Err(BusError::Internal(format!(
                    "unknown backend type '{other}', expected 'standalone' or 'integrated'"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_standalone_lifecycle() {
        let backend = StandaloneBackend::new();
        assert!(!backend.is_ready());
        backend.initialize().await.unwrap();
        assert!(backend.is_ready());
        assert!(backend.logger().is_some());
        assert!(backend.monitoring().is_none());
        backend.shutdown().await.unwrap();
        assert!(!backend.is_ready());
    }

    #[tokio::test]
    async fn test_standalone_executor_runs_work() {
        let backend = StandaloneBackend::new();
        backend.initialize().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        backend.executor().spawn(Box::pin(async move {
            let _ = tx.send(42u32);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_integrated_delegates() {
        struct CountingExecutor(AtomicUsize);
        impl Executor for CountingExecutor {
            fn spawn(&self, work: BoxFuture<'static, ()>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(work);
            }
        }

        let executor = Arc::new(CountingExecutor(AtomicUsize::new(0)));
        let backend = IntegratedBackend::new(executor.clone());
        backend.initialize().await.unwrap();

        assert!(backend.logger().is_none());
        assert!(backend.monitoring().is_none());

        backend.executor().spawn(Box::pin(async {}));
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
    }
}
