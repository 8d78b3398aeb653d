//! Message broker: a named-route registry over the topic matcher.
//!
//! Where the router deals in anonymous subscriptions, the broker manages
//! named routes that can be toggled, inspected and counted individually.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::pattern::TopicPattern;
use crate::router::MessageHandler;

struct Route {
    id: String,
    pattern: TopicPattern,
    handler: Arc<dyn MessageHandler>,
    priority: i32,
    active: AtomicBool,
    messages_processed: AtomicU64,
}

/// Plain-data view of one route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub route_id: String,
    pub pattern: String,
    pub priority: i32,
    pub active: bool,
    pub messages_processed: u64,
}

/// Monotonic broker counters
#[derive(Debug, Default)]
pub struct BrokerStats {
    routed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    unrouted: AtomicU64,
}

/// Plain-data snapshot of [`BrokerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub messages_routed: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub messages_unrouted: u64,
    pub active_routes: usize,
}

/// Named-route registry with per-route statistics.
pub struct MessageBroker {
    config: BrokerConfig,
    routes: RwLock<Vec<Arc<Route>>>,
    stats: BrokerStats,
    running: AtomicBool,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            routes: RwLock::new(Vec::new()),
            stats: BrokerStats::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!("Message broker started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("Message broker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a route under a unique id.
    pub fn add_route(
        &self,
        route_id: impl Into<String>,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        priority: i32,
    ) -> BusResult<()> {
        let route_id = route_id.into();
        let pattern = TopicPattern::parse(pattern)?;

        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.iter().any(|r| r.id == route_id) {
            return Err(BusError::DuplicateRoute(route_id));
        }
        if routes.len() >= self.config.max_routes {
            return Err(BusError::DuplicateRoute(format!(
                "route table full ({} max)",
                self.config.max_routes
            )));
        }

        let route = Arc::new(Route {
            id: route_id.clone(),
            pattern,
            handler,
            priority,
            active: AtomicBool::new(true),
            messages_processed: AtomicU64::new(0),
        });

        // Kept in dispatch order: priority desc, registration order asc.
        let pos = routes
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(routes.len());
        routes.insert(pos, route);

        tracing::debug!(route_id = %route_id, priority, "Route added");
        Ok(())
    }

    pub fn remove_route(&self, route_id: &str) -> BusResult<()> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.iter().position(|r| r.id == route_id) {
            Some(pos) => {
                routes.remove(pos);
                Ok(())
            }
            None => Err(BusError::RouteNotFound(route_id.to_string())),
        }
    }

    pub fn enable_route(&self, route_id: &str) -> BusResult<()> {
        self.set_active(route_id, true)
    }

    pub fn disable_route(&self, route_id: &str) -> BusResult<()> {
        self.set_active(route_id, false)
    }

    fn set_active(&self, route_id: &str, active: bool) -> BusResult<()> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        match routes.iter().find(|r| r.id == route_id) {
            Some(route) => {
                route.active.store(active, Ordering::SeqCst);
                Ok(())
            }
            None => Err(BusError::RouteNotFound(route_id.to_string())),
        }
    }

    /// Route a message through every matching active route, in priority
    /// order. Handler failures are counted per broker; they do not stop
    /// delivery to the remaining routes.
    pub async fn route(&self, message: &Message) -> BusResult<()> {
        if !self.is_running() {
            return Err(BusError::BrokerUnavailable("broker not started".into()));
        }
        self.stats.routed.fetch_add(1, Ordering::Relaxed);

        let matching: Vec<Arc<Route>> = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|r| r.active.load(Ordering::SeqCst) && r.pattern.matches(&message.topic))
                .cloned()
                .collect()
        };

        if matching.is_empty() {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        for route in matching {
            let outcome = if self.config.default_timeout.is_zero() {
                route.handler.handle(message).await
            } else {
                match tokio::time::timeout(
                    self.config.default_timeout,
                    route.handler.handle(message),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BusError::Internal(format!(
                        "route '{}' timed out after {:?}",
                        route.id, self.config.default_timeout
                    ))),
                }
            };

            match outcome {
                Ok(()) => {
                    route.messages_processed.fetch_add(1, Ordering::Relaxed);
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        route_id = %route.id,
                        topic = %message.topic,
                        error = %e,
                        "Route handler failed"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get_route(&self, route_id: &str) -> Option<RouteInfo> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().find(|r| r.id == route_id).map(route_info)
    }

    /// All routes in dispatch order
    pub fn get_routes(&self) -> Vec<RouteInfo> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().map(route_info).collect()
    }

    pub fn clear_routes(&self) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.clear();
    }

    pub fn route_count(&self) -> usize {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.len()
    }

    pub fn statistics(&self) -> BrokerStatsSnapshot {
        let active_routes = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|r| r.active.load(Ordering::SeqCst))
                .count()
        };
        BrokerStatsSnapshot {
            messages_routed: self.stats.routed.load(Ordering::Relaxed),
            messages_delivered: self.stats.delivered.load(Ordering::Relaxed),
            messages_failed: self.stats.failed.load(Ordering::Relaxed),
            messages_unrouted: self.stats.unrouted.load(Ordering::Relaxed),
            active_routes,
        }
    }

    pub fn reset(&self) {
        self.stats.routed.store(0, Ordering::Relaxed);
        self.stats.delivered.store(0, Ordering::Relaxed);
        self.stats.failed.store(0, Ordering::Relaxed);
        self.stats.unrouted.store(0, Ordering::Relaxed);
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        for route in routes.iter() {
            route.messages_processed.store(0, Ordering::Relaxed);
        }
    }
}

fn route_info(route: &Arc<Route>) -> RouteInfo {
    RouteInfo {
        route_id: route.id.clone(),
        pattern: route.pattern.as_str().to_string(),
        priority: route.priority,
        active: route.active.load(Ordering::SeqCst),
        messages_processed: route.messages_processed.load(Ordering::Relaxed),
    }
}
