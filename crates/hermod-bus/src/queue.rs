//! Bounded message queue with back-pressure.
//!
//! FIFO by default; with `priority_enabled` the queue orders by message
//! priority, FIFO among equals (stable). Expired messages are silently
//! dropped at dequeue time and counted.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{BusError, BusResult};
use crate::message::Message;

struct PrioEntry {
    seq: u64,
    message: Message,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioEntry {
    // Max-heap: higher priority wins, earlier seq breaks ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Store {
    Fifo(VecDeque<Message>),
    Prio(BinaryHeap<PrioEntry>),
}

impl Store {
    fn len(&self) -> usize {
        match self {
            Self::Fifo(q) => q.len(),
            Self::Prio(h) => h.len(),
        }
    }

    fn push(&mut self, message: Message, seq: u64) {
        match self {
            Self::Fifo(q) => q.push_back(message),
            Self::Prio(h) => h.push(PrioEntry { seq, message }),
        }
    }

    fn pop(&mut self) -> Option<Message> {
        match self {
            Self::Fifo(q) => q.pop_front(),
            Self::Prio(h) => h.pop().map(|e| e.message),
        }
    }

    /// Remove the entry that has waited longest, regardless of priority.
    fn drop_oldest(&mut self) -> Option<Message> {
        match self {
            Self::Fifo(q) => q.pop_front(),
            Self::Prio(h) => {
                let mut entries: Vec<PrioEntry> = std::mem::take(h).into_vec();
                let oldest = entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(i, _)| i)?;
                let dropped = entries.swap_remove(oldest);
                *h = entries.into();
                Some(dropped.message)
            }
        }
    }

    fn clear(&mut self) -> usize {
        let n = self.len();
        match self {
            Self::Fifo(q) => q.clear(),
            Self::Prio(h) => h.clear(),
        }
        n
    }
}

struct Inner {
    store: Store,
    seq: u64,
    stopped: bool,
}

/// Plain-data view of the queue's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub depth: usize,
    pub dropped: u64,
    pub expired_dropped: u64,
}

/// Bounded in-process message queue.
pub struct MessageQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    dropped: AtomicU64,
    expired_dropped: AtomicU64,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        let store = if config.priority_enabled {
            Store::Prio(BinaryHeap::new())
        } else {
            Store::Fifo(VecDeque::new())
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                store,
                seq: 0,
                stopped: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            expired_dropped: AtomicU64::new(0),
        }
    }

    /// Add a message, applying the overflow policy at capacity.
    pub fn enqueue(&self, message: Message) -> BusResult<()> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.stopped {
                return Err(BusError::QueueStopped);
            }
            if inner.store.len() >= self.config.max_size {
                match self.config.overflow {
                    OverflowPolicy::Reject => {
                        return Err(BusError::QueueFull(message.topic.clone()));
                    }
                    OverflowPolicy::DropOldest => {
                        if inner.store.drop_oldest().is_some() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            let seq = inner.seq;
            inner.seq += 1;
            inner.store.push(message, seq);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue.
    ///
    /// Returns `QueueEmpty` when nothing is queued, `QueueStopped` once the
    /// queue has been stopped and drained.
    pub fn try_dequeue(&self) -> BusResult<Message> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match inner.store.pop() {
                Some(message) => {
                    if message.is_expired() {
                        self.expired_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            message_id = %message.id,
                            topic = %message.topic,
                            "Dropping expired message at dequeue"
                        );
                        continue;
                    }
                    return Ok(message);
                }
                None => {
                    return if inner.stopped {
                        Err(BusError::QueueStopped)
                    } else {
                        Err(BusError::QueueEmpty)
                    };
                }
            }
        }
    }

    /// Dequeue, waiting up to `timeout` for a message to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> BusResult<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_dequeue() {
                Ok(message) => {
                    // Wake another waiter if work remains.
                    if !self.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(message);
                }
                Err(BusError::QueueEmpty) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::QueueEmpty);
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all queued messages; returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.store.clear()
    }

    /// Stop the queue, waking all blocked dequeues with `QueueStopped`.
    ///
    /// Already-queued messages stay dequeueable so the owner can drain.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.stopped = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stopped
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            depth: self.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            expired_dropped: self.expired_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use crate::value::ValueContainer;

    fn msg(topic: &str, priority: Priority, id: i64) -> Message {
        Message::builder(topic)
            .priority(priority)
            .payload(ValueContainer::new().with("id", id))
            .build()
            .unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(QueueConfig::default());
        for i in 0..3 {
            queue.enqueue(msg("t.a", Priority::Normal, i)).unwrap();
        }
        for i in 0..3 {
            let m = queue.try_dequeue().unwrap();
            assert_eq!(m.payload.get_i64("id"), Some(i));
        }
        assert!(matches!(queue.try_dequeue(), Err(BusError::QueueEmpty)));
    }

    #[test]
    fn test_priority_preemption() {
        let queue = MessageQueue::new(QueueConfig::default().with_priority(true));
        queue.enqueue(msg("t.a", Priority::Normal, 1)).unwrap();
        queue.enqueue(msg("t.a", Priority::Critical, 2)).unwrap();
        queue.enqueue(msg("t.a", Priority::Low, 3)).unwrap();

        let order: Vec<i64> = (0..3)
            .map(|_| queue.try_dequeue().unwrap().payload.get_i64("id").unwrap())
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_priority_stable_within_level() {
        let queue = MessageQueue::new(QueueConfig::default().with_priority(true));
        for i in 0..5 {
            queue.enqueue(msg("t.a", Priority::High, i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(
                queue.try_dequeue().unwrap().payload.get_i64("id"),
                Some(i)
            );
        }
    }

    #[test]
    fn test_reject_when_full() {
        let queue = MessageQueue::new(QueueConfig::default().with_max_size(2));
        queue.enqueue(msg("t.a", Priority::Normal, 1)).unwrap();
        queue.enqueue(msg("t.a", Priority::Normal, 2)).unwrap();

        let err = queue.enqueue(msg("t.a", Priority::Normal, 3)).unwrap_err();
        assert!(matches!(err, BusError::QueueFull(_)));
        // Queue unchanged
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue().unwrap().payload.get_i64("id"), Some(1));
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = MessageQueue::new(
            QueueConfig::default()
                .with_max_size(2)
                .with_overflow(OverflowPolicy::DropOldest),
        );
        queue.enqueue(msg("t.a", Priority::Normal, 1)).unwrap();
        queue.enqueue(msg("t.a", Priority::Normal, 2)).unwrap();
        queue.enqueue(msg("t.a", Priority::Normal, 3)).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.try_dequeue().unwrap().payload.get_i64("id"), Some(2));
        assert_eq!(queue.try_dequeue().unwrap().payload.get_i64("id"), Some(3));
    }

    #[test]
    fn test_drop_oldest_in_priority_mode_drops_longest_waiting() {
        let queue = MessageQueue::new(
            QueueConfig::default()
                .with_max_size(2)
                .with_overflow(OverflowPolicy::DropOldest)
                .with_priority(true),
        );
        queue.enqueue(msg("t.a", Priority::Critical, 1)).unwrap();
        queue.enqueue(msg("t.a", Priority::Low, 2)).unwrap();
        queue.enqueue(msg("t.a", Priority::Normal, 3)).unwrap();

        // id=1 was oldest and is gone despite its high priority
        let order: Vec<i64> = (0..2)
            .map(|_| queue.try_dequeue().unwrap().payload.get_i64("id").unwrap())
            .collect();
        assert_eq!(order, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_times_out() {
        let queue = MessageQueue::new(QueueConfig::default());
        let start = std::time::Instant::now();
        let err = queue.dequeue(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BusError::QueueEmpty));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_blocking_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MessageQueue::new(QueueConfig::default()));
        let q2 = queue.clone();

        let waiter = tokio::spawn(async move { q2.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(msg("t.a", Priority::Normal, 7)).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.payload.get_i64("id"), Some(7));
    }

    #[tokio::test]
    async fn test_stop_unblocks_waiters() {
        let queue = std::sync::Arc::new(MessageQueue::new(QueueConfig::default()));
        let q2 = queue.clone();

        let waiter = tokio::spawn(async move { q2.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::QueueStopped));
        assert!(matches!(
            queue.enqueue(msg("t.a", Priority::Normal, 1)),
            Err(BusError::QueueStopped)
        ));
    }

    #[test]
    fn test_stop_still_drains_queued_items() {
        let queue = MessageQueue::new(QueueConfig::default());
        queue.enqueue(msg("t.a", Priority::Normal, 1)).unwrap();
        queue.stop();

        assert_eq!(queue.try_dequeue().unwrap().payload.get_i64("id"), Some(1));
        assert!(matches!(queue.try_dequeue(), Err(BusError::QueueStopped)));
    }

    #[test]
    fn test_expired_messages_dropped_silently() {
        let queue = MessageQueue::new(QueueConfig::default());
        let mut expired = msg("t.a", Priority::Normal, 1);
        expired.ttl = Some(Duration::from_millis(1));
        expired.timestamp = chrono::Utc::now() - chrono::Duration::seconds(10);
        queue.enqueue(expired).unwrap();
        queue.enqueue(msg("t.a", Priority::Normal, 2)).unwrap();

        let m = queue.try_dequeue().unwrap();
        assert_eq!(m.payload.get_i64("id"), Some(2));
        assert_eq!(queue.stats().expired_dropped, 1);
    }

    #[test]
    fn test_clear() {
        let queue = MessageQueue::new(QueueConfig::default());
        for i in 0..4 {
            queue.enqueue(msg("t.a", Priority::Normal, i)).unwrap();
        }
        assert_eq!(queue.clear(), 4);
        assert!(queue.is_empty());
    }
}
