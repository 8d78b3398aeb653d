//! Configuration for queue, bus and broker.

use std::time::Duration;

/// Behavior when an enqueue hits a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail the enqueue with `QueueFull`
    #[default]
    Reject,
    /// Drop the oldest queued message, count it, accept the new one
    DropOldest,
}

/// Message queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on queued messages
    pub max_size: usize,
    /// Policy applied when the bound is hit
    pub overflow: OverflowPolicy,
    /// Priority ordering instead of FIFO
    pub priority_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            overflow: OverflowPolicy::Reject,
            priority_enabled: false,
        }
    }
}

impl QueueConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_priority(mut self, enabled: bool) -> Self {
        self.priority_enabled = enabled;
        self
    }
}

/// Message bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Dispatch worker count
    pub worker_threads: usize,
    /// Per-message dispatch timeout; `Duration::ZERO` disables it
    pub processing_timeout: Duration,
    /// How long a worker waits on an empty queue before re-checking shutdown
    pub poll_interval: Duration,
    /// How long `stop` waits for queued and in-flight messages
    pub drain_timeout: Duration,
    /// Queue configuration
    pub queue: QueueConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            processing_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(5),
            queue: QueueConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Propagates to the underlying queue
    pub fn with_priority_queue(mut self, enabled: bool) -> Self {
        self.queue.priority_enabled = enabled;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Message broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Cap on registered routes
    pub max_routes: usize,
    /// Default per-route dispatch timeout; `Duration::ZERO` disables it
    pub default_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_routes: 1024,
            default_timeout: Duration::ZERO,
        }
    }
}

impl BrokerConfig {
    pub fn with_max_routes(mut self, max_routes: usize) -> Self {
        self.max_routes = max_routes;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
