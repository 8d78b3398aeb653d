//! Subscription registry and topic-based dispatch.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::pattern::TopicPattern;

/// Opaque, monotonically increasing subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler invoked for messages matching a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> BusResult<()>;
}

/// Adapter turning a synchronous closure into a [`MessageHandler`].
///
/// Handlers that need to await should implement the trait directly.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Message) -> BusResult<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> BusResult<()> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> BusResult<()> {
        (self.f)(message)
    }
}

/// Predicate applied before a subscription's handler runs
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    handler: Arc<dyn MessageHandler>,
    filter: Option<MessageFilter>,
    priority: i32,
}

/// Outcome of one [`TopicRouter::route`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscriptions whose pattern matched the topic
    pub matched: usize,
    /// Handlers invoked and returning Ok
    pub delivered: usize,
    /// Handlers invoked and returning Err
    pub failed: usize,
    /// Matches skipped by their filter
    pub filtered: usize,
}

/// Default subscription priority
pub const DEFAULT_PRIORITY: i32 = 5;

/// Pattern-matching subscription registry.
///
/// Dispatch visits matching subscriptions in (priority descending, id
/// ascending) order. The subscription list is kept in dispatch order, so
/// `route` only snapshots the matching slice; handlers never run under the
/// registry lock.
pub struct TopicRouter {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a handler for every topic matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
        priority: i32,
    ) -> BusResult<SubscriptionId> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let subscription = Subscription {
            id,
            pattern,
            handler,
            filter,
            priority,
        };

        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        // Insert in dispatch order: priority desc, id asc. New ids are the
        // largest yet, so the slot is right after the last equal-priority
        // entry.
        let pos = subs
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subs.len());
        subs.insert(pos, subscription);

        tracing::debug!(subscription_id = %id, priority, "Subscription registered");
        Ok(id)
    }

    /// Remove a subscription by handle.
    pub fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        match subs.iter().position(|s| s.id == id) {
            Some(pos) => {
                subs.remove(pos);
                tracing::debug!(subscription_id = %id, "Subscription removed");
                Ok(())
            }
            None => Err(BusError::SubscriptionNotFound(id.to_string())),
        }
    }

    /// Dispatch a message to every matching subscription.
    ///
    /// A handler error is counted and logged but never aborts delivery to
    /// the remaining matches.
    pub async fn route(&self, message: &Message) -> BusResult<DispatchReport> {
        let matching: Vec<(SubscriptionId, Arc<dyn MessageHandler>, Option<MessageFilter>)> = {
            let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.pattern.matches(&message.topic))
                .map(|s| (s.id, s.handler.clone(), s.filter.clone()))
                .collect()
        };

        let mut report = DispatchReport {
            matched: matching.len(),
            ..Default::default()
        };

        for (id, handler, filter) in matching {
            if let Some(filter) = filter {
                if !filter(message) {
                    report.filtered += 1;
                    continue;
                }
            }

            match handler.handle(message).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription_id = %id,
                        topic = %message.topic,
                        message_id = %message.id,
                        error = %e,
                        "Subscription handler failed"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        subs.len()
    }

    /// Total handler failures since creation
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> Arc<dyn MessageHandler> {
        let tag = tag.to_string();
        Arc::new(FnHandler::new(move |msg: &Message| {
            log.lock().unwrap().push(format!("{tag}:{}", msg.topic));
            Ok(())
        }))
    }

    fn msg(topic: &str) -> Message {
        Message::builder(topic).build().unwrap()
    }

    #[tokio::test]
    async fn test_wildcard_routing() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router
            .subscribe("user.*", recording_handler(log.clone(), "A"), None, 5)
            .unwrap();
        router
            .subscribe("user.#", recording_handler(log.clone(), "B"), None, 5)
            .unwrap();

        router.route(&msg("user.created")).await.unwrap();
        router.route(&msg("user.profile.updated")).await.unwrap();

        let entries = log.lock().unwrap().clone();
        // A receives only the two-segment topic; B receives both.
        assert_eq!(
            entries,
            vec![
                "A:user.created",
                "B:user.created",
                "B:user.profile.updated"
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_order_priority_then_id() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered low first, but high priority must run first; ties run
        // in subscription order.
        router
            .subscribe("t.#", recording_handler(log.clone(), "low"), None, 1)
            .unwrap();
        router
            .subscribe("t.#", recording_handler(log.clone(), "high-a"), None, 9)
            .unwrap();
        router
            .subscribe("t.#", recording_handler(log.clone(), "high-b"), None, 9)
            .unwrap();
        router
            .subscribe("t.#", recording_handler(log.clone(), "mid"), None, 5)
            .unwrap();

        router.route(&msg("t.x")).await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["high-a:t.x", "high-b:t.x", "mid:t.x", "low:t.x"]);
    }

    #[tokio::test]
    async fn test_filter_skips_without_failure() {
        let router = TopicRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let filter: MessageFilter = Arc::new(|m: &Message| m.priority >= Priority::High);
        router
            .subscribe(
                "t.#",
                Arc::new(FnHandler::new(move |_: &Message| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                Some(filter),
                5,
            )
            .unwrap();

        let report = router.route(&msg("t.low")).await.unwrap();
        assert_eq!(report.filtered, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 0);

        let high = Message::builder("t.high")
            .priority(Priority::Critical)
            .build()
            .unwrap();
        let report = router.route(&high).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_abort_siblings() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router
            .subscribe(
                "t.#",
                Arc::new(FnHandler::new(|_: &Message| {
                    Err(BusError::Internal("boom".into()))
                })),
                None,
                9,
            )
            .unwrap();
        router
            .subscribe("t.#", recording_handler(log.clone(), "ok"), None, 5)
            .unwrap();

        let report = router.route(&msg("t.x")).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(router.failure_count(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = router
            .subscribe("t.#", recording_handler(log.clone(), "x"), None, 5)
            .unwrap();
        assert_eq!(router.subscription_count(), 1);

        router.unsubscribe(id).unwrap();
        assert_eq!(router.subscription_count(), 0);
        assert!(matches!(
            router.unsubscribe(id),
            Err(BusError::SubscriptionNotFound(_))
        ));

        router.route(&msg("t.x")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_at_most_once_per_message() {
        // Overlapping patterns on one subscription still deliver once.
        let router = TopicRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        router
            .subscribe(
                "user.#",
                Arc::new(FnHandler::new(move |_: &Message| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                None,
                5,
            )
            .unwrap();

        router.route(&msg("user.created")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
