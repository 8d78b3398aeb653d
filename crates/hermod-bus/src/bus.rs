//! Message bus: queueing, worker dispatch, request/reply correlation.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use hermod_common::trace::{current_trace_id, new_trace_id, with_trace_id};

use crate::backend::Backend;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::message::{Message, MessageType};
use crate::pattern::validate_topic;
use crate::queue::MessageQueue;
use crate::router::{MessageFilter, MessageHandler, SubscriptionId, TopicRouter, DEFAULT_PRIORITY};

/// Monotonic bus counters
#[derive(Debug, Default)]
pub struct BusStats {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    sent_remote: AtomicU64,
    received_remote: AtomicU64,
}

/// Plain-data snapshot of [`BusStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub messages_published: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_dropped: u64,
    pub messages_sent_remote: u64,
    pub messages_received_remote: u64,
}

impl BusStats {
    fn reset(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.sent_remote.store(0, Ordering::Relaxed);
        self.received_remote.store(0, Ordering::Relaxed);
    }
}

struct BusInner {
    config: BusConfig,
    queue: MessageQueue,
    router: TopicRouter,
    backend: Arc<dyn Backend>,
    pending_replies: DashMap<String, oneshot::Sender<Message>>,
    stats: BusStats,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
}

/// Publish/subscribe message bus.
///
/// Composes a bounded [`MessageQueue`], a [`TopicRouter`] and a worker pool
/// supplied by the [`Backend`]'s executor. Cloning is cheap and shares the
/// same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(backend: Arc<dyn Backend>, config: BusConfig) -> Self {
        let queue = MessageQueue::new(config.queue.clone());
        Self {
            inner: Arc::new(BusInner {
                queue,
                router: TopicRouter::new(),
                backend,
                pending_replies: DashMap::new(),
                stats: BusStats::default(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Start the dispatch workers.
    ///
    /// Initializes the backend if it is not ready yet.
    pub async fn start(&self) -> BusResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.backend.is_ready() {
            self.inner.backend.initialize().await?;
        }
        if !self.inner.backend.is_ready() {
            return Err(BusError::BackendNotReady("backend failed to initialize".into()));
        }

        let executor = self.inner.backend.executor();
        for worker_id in 0..self.inner.config.worker_threads {
            let inner = self.inner.clone();
            let fut = self
                .inner
                .tracker
                .track_future(async move { worker_loop(inner, worker_id).await });
            executor.spawn(Box::pin(fut));
        }

        tracing::info!(
            workers = self.inner.config.worker_threads,
            priority_queue = self.inner.config.queue.priority_enabled,
            "Message bus started"
        );
        Ok(())
    }

    /// Stop the bus: drain queued and in-flight messages up to the drain
    /// timeout, then halt the workers.
    ///
    /// The backend is left running; its owner shuts it down.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.drain_timeout;
        while !self.inner.queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.queue.stop();
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout_at(deadline, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Bus workers did not stop within drain timeout");
        }

        // Abandon outstanding request futures.
        self.inner.pending_replies.clear();
        tracing::info!("Message bus stopped");
    }

    /// Publish a message onto the bus queue.
    ///
    /// Validates the topic and expiry, captures the ambient trace id, and
    /// returns as soon as the message is enqueued; it never waits for
    /// dispatch, so publishing from within a handler cannot deadlock.
    pub fn publish(&self, mut message: Message) -> BusResult<()> {
        validate_topic(&message.topic)
            .map_err(|e| BusError::InvalidMessage(format!("unroutable topic: {e}")))?;
        if message.is_expired() {
            return Err(BusError::MessageExpired(message.id.to_string()));
        }
        if message.trace_id.is_none() {
            message.trace_id = current_trace_id();
        }

        self.inner.queue.enqueue(message)?;
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Subscribe with default priority and no filter.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<SubscriptionId> {
        self.inner
            .router
            .subscribe(pattern, handler, None, DEFAULT_PRIORITY)
    }

    /// Subscribe with an explicit filter and priority.
    pub fn subscribe_with(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
        priority: i32,
    ) -> BusResult<SubscriptionId> {
        self.inner.router.subscribe(pattern, handler, filter, priority)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        self.inner.router.unsubscribe(id)
    }

    /// Publish a request and await the correlated reply.
    ///
    /// The request's `correlation_id` (defaulting to its own id) keys a
    /// pending entry; a `Reply` message carrying that correlation resolves
    /// it without router dispatch. On timeout the entry is removed and a
    /// `RequestTimeout` error returned.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> BusResult<Message> {
        let correlation = message
            .correlation_id
            .get_or_insert_with(|| message.id.to_string())
            .clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending_replies.insert(correlation.clone(), tx);

        if let Err(e) = self.publish(message) {
            self.inner.pending_replies.remove(&correlation);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Internal("bus stopped while awaiting reply".into())),
            Err(_) => {
                self.inner.pending_replies.remove(&correlation);
                Err(BusError::RequestTimeout(timeout))
            }
        }
    }

    /// Record a message handed to a remote transport (hybrid operation).
    pub fn record_remote_sent(&self) {
        self.inner.stats.sent_remote.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message received from a remote transport (hybrid operation).
    pub fn record_remote_received(&self) {
        self.inner
            .stats
            .received_remote
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> BusStatsSnapshot {
        let queue = self.inner.queue.stats();
        BusStatsSnapshot {
            messages_published: self.inner.stats.published.load(Ordering::Relaxed),
            messages_processed: self.inner.stats.processed.load(Ordering::Relaxed),
            messages_failed: self.inner.stats.failed.load(Ordering::Relaxed),
            messages_dropped: queue.dropped + queue.expired_dropped,
            messages_sent_remote: self.inner.stats.sent_remote.load(Ordering::Relaxed),
            messages_received_remote: self.inner.stats.received_remote.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    /// Messages waiting in the bus queue
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

async fn worker_loop(inner: Arc<BusInner>, worker_id: usize) {
    tracing::debug!(worker_id, "Bus worker started");
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                // Drain whatever is immediately available, then exit.
                while let Ok(message) = inner.queue.try_dequeue() {
                    dispatch(&inner, message).await;
                }
                break;
            }
            result = inner.queue.dequeue(inner.config.poll_interval) => {
                match result {
                    Ok(message) => dispatch(&inner, message).await,
                    Err(BusError::QueueEmpty) => {}
                    Err(BusError::QueueStopped) => break,
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "Bus worker dequeue failed");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(worker_id, "Bus worker stopped");
}

async fn dispatch(inner: &Arc<BusInner>, message: Message) {
    // A correlated reply resolves its pending request and skips the router.
    if message.kind == MessageType::Reply {
        if let Some(correlation) = &message.correlation_id {
            if let Some((_, tx)) = inner.pending_replies.remove(correlation) {
                let _ = tx.send(message);
                inner.stats.processed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    let trace_id = message
        .trace_id
        .clone()
        .unwrap_or_else(new_trace_id);
    let routed = with_trace_id(trace_id, async {
        let route_fut = inner.router.route(&message);
        if inner.config.processing_timeout.is_zero() {
            route_fut.await.map(Some)
        } else {
            match tokio::time::timeout(inner.config.processing_timeout, route_fut).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            }
        }
    })
    .await;

    match routed {
        Ok(Some(report)) => {
            inner.stats.processed.fetch_add(1, Ordering::Relaxed);
            if report.failed > 0 {
                inner
                    .stats
                    .failed
                    .fetch_add(report.failed as u64, Ordering::Relaxed);
            }
        }
        Ok(None) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %message.id,
                topic = %message.topic,
                timeout = ?inner.config.processing_timeout,
                "Message dispatch timed out"
            );
        }
        Err(e) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %message.id,
                topic = %message.topic,
                error = %e,
                "Message dispatch failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StandaloneBackend;
    use crate::message::Priority;
    use crate::router::FnHandler;
    use crate::value::ValueContainer;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> MessageBus {
        MessageBus::new(Arc::new(StandaloneBackend::new()), BusConfig::default())
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_publish_dispatches_to_subscriber() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        bus.subscribe(
            "user.#",
            Arc::new(FnHandler::new(move |_: &Message| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();

        bus.start().await.unwrap();
        bus.publish(Message::builder("user.created").build().unwrap())
            .unwrap();
        bus.publish(Message::builder("order.created").build().unwrap())
            .unwrap();

        wait_until(|| bus.statistics().messages_processed == 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.statistics().messages_published, 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_publish_rejects_expired() {
        let bus = bus();
        let mut msg = Message::builder("t.a")
            .ttl(Duration::from_millis(1))
            .build()
            .unwrap();
        msg.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);
        assert!(matches!(
            bus.publish(msg),
            Err(BusError::MessageExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let bus = bus();

        // Echo server: replies to queries on svc.echo, publishing from
        // inside the handler (must not deadlock).
        let server_bus = bus.clone();
        bus.subscribe(
            "svc.echo",
            Arc::new(FnHandler::new(move |msg: &Message| {
                if msg.kind == MessageType::Reply {
                    return Ok(());
                }
                let reply = msg
                    .reply_to("svc.echo")
                    .payload(msg.payload.clone())
                    .build()?;
                server_bus.publish(reply)
            })),
        )
        .unwrap();

        bus.start().await.unwrap();

        let request = Message::builder("svc.echo")
            .kind(MessageType::Query)
            .payload(ValueContainer::new().with("ping", 1i64))
            .build()
            .unwrap();

        let reply = bus
            .request(request, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageType::Reply);
        assert_eq!(reply.payload.get_i64("ping"), Some(1));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_unrelated_publication_does_not_resolve_request() {
        let bus = bus();
        bus.start().await.unwrap();

        // A reply correlated to some other exchange.
        let stray = Message::builder("svc.echo")
            .kind(MessageType::Reply)
            .correlation_id("not-our-request")
            .build()
            .unwrap();
        bus.publish(stray).unwrap();

        let request = Message::builder("svc.echo")
            .kind(MessageType::Query)
            .build()
            .unwrap();
        let err = bus
            .request(request, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout(_)));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_handler_failure_counted_not_fatal() {
        let bus = bus();
        bus.subscribe(
            "t.#",
            Arc::new(FnHandler::new(|_: &Message| {
                Err(BusError::Internal("boom".into()))
            })),
        )
        .unwrap();
        bus.start().await.unwrap();

        bus.publish(Message::builder("t.a").build().unwrap()).unwrap();
        wait_until(|| bus.statistics().messages_processed == 1).await;
        assert_eq!(bus.statistics().messages_failed, 1);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            "t.#",
            Arc::new(FnHandler::new(move |_: &Message| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
        .unwrap();

        bus.start().await.unwrap();
        for _ in 0..20 {
            bus.publish(Message::builder("t.a").build().unwrap()).unwrap();
        }
        bus.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_priority_queue_orders_dispatch() {
        let backend = Arc::new(StandaloneBackend::new());
        let bus = MessageBus::new(
            backend,
            BusConfig::default()
                .with_worker_threads(1)
                .with_priority_queue(true),
        );

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order2 = order.clone();
        bus.subscribe(
            "t.#",
            Arc::new(FnHandler::new(move |msg: &Message| {
                order2
                    .lock()
                    .unwrap()
                    .push(msg.payload.get_i64("id").unwrap());
                Ok(())
            })),
        )
        .unwrap();

        // Enqueue before starting so ordering is decided by the queue.
        for (priority, id) in [
            (Priority::Normal, 1i64),
            (Priority::Critical, 2),
            (Priority::Low, 3),
        ] {
            bus.publish(
                Message::builder("t.a")
                    .priority(priority)
                    .payload(ValueContainer::new().with("id", id))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        }

        bus.start().await.unwrap();
        wait_until(|| bus.statistics().messages_processed == 3).await;
        assert_eq!(order.lock().unwrap().clone(), vec![2, 1, 3]);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let bus = bus();
        bus.publish(Message::builder("t.a").build().unwrap()).unwrap();
        assert_eq!(bus.statistics().messages_published, 1);
        bus.reset_statistics();
        assert_eq!(bus.statistics().messages_published, 0);
    }
}
