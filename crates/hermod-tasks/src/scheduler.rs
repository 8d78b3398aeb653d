//! Periodic and cron-based task scheduling.
//!
//! The scheduler keeps a registry of schedule entries and runs one loop
//! that sleeps until the earliest `next_run`, submits every due entry via
//! the task client, and recomputes. Registry changes wake the loop so they
//! take effect without waiting out the previous sleep.
//!
//! Cron expressions use the classic five fields (minute, hour, day-of-month,
//! month, day-of-week) with `*`, `n`, `a-b`, `a,b,c` and `*/n`; they are
//! evaluated by the `cron` crate after prefixing a zero seconds field.

use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use hermod_bus::Executor;

use crate::client::TaskClient;
use crate::error::{TaskError, TaskResult};
use crate::workflow::TaskSignature;

/// Timezone used for cron evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerTimezone {
    #[default]
    Utc,
    Local,
}

/// Scheduler configuration
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub timezone: SchedulerTimezone,
}

impl SchedulerConfig {
    pub fn with_timezone(mut self, timezone: SchedulerTimezone) -> Self {
        self.timezone = timezone;
        self
    }
}

/// What fires a schedule entry
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fixed interval between runs
    Interval(Duration),
    /// Five-field cron expression
    Cron(String),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {d:?}"),
            Self::Cron(expr) => write!(f, "cron '{expr}'"),
        }
    }
}

struct Entry {
    signature: TaskSignature,
    trigger: Trigger,
    schedule: Option<cron::Schedule>,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

/// Plain-data view of one schedule entry
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Parse a five-field cron expression into a `cron::Schedule`.
fn parse_cron(expr: &str) -> TaskResult<cron::Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(TaskError::InvalidSchedule(format!(
            "expected 5 cron fields, got {} in '{expr}'",
            fields.len()
        )));
    }
    cron::Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| TaskError::InvalidSchedule(format!("'{expr}': {e}")))
}

/// Background scheduler submitting tasks on interval or cron triggers.
pub struct Scheduler {
    config: SchedulerConfig,
    client: TaskClient,
    entries: Mutex<HashMap<String, Entry>>,
    notify: Notify,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, client: TaskClient) -> Self {
        Self {
            config,
            client,
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Start the scheduling loop on the given executor.
    pub fn start(self: &Arc<Self>, executor: &Arc<dyn Executor>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        executor.spawn(Box::pin(async move { scheduler.run_loop().await }));
        tracing::info!("Scheduler started");
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.cancel();
            self.notify.notify_waiters();
            tracing::info!("Scheduler stopped");
        }
    }

    /// Register an interval schedule. The first run fires one interval
    /// from now.
    pub fn add_interval(
        &self,
        name: impl Into<String>,
        signature: TaskSignature,
        interval: Duration,
    ) -> TaskResult<()> {
        if interval.is_zero() {
            return Err(TaskError::InvalidSchedule("interval must be non-zero".into()));
        }
        self.insert(name.into(), signature, Trigger::Interval(interval), None)
    }

    /// Register a cron schedule from a five-field expression.
    pub fn add_cron(
        &self,
        name: impl Into<String>,
        signature: TaskSignature,
        expression: &str,
    ) -> TaskResult<()> {
        let schedule = parse_cron(expression)?;
        self.insert(
            name.into(),
            signature,
            Trigger::Cron(expression.to_string()),
            Some(schedule),
        )
    }

    fn insert(
        &self,
        name: String,
        signature: TaskSignature,
        trigger: Trigger,
        schedule: Option<cron::Schedule>,
    ) -> TaskResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&name) {
            return Err(TaskError::InvalidSchedule(format!(
                "schedule '{name}' already exists"
            )));
        }

        let mut entry = Entry {
            signature,
            trigger,
            schedule,
            enabled: true,
            last_run: None,
            next_run: None,
        };
        entry.next_run = self.compute_next_run(&entry, Utc::now());
        tracing::info!(
            schedule = %name,
            trigger = %entry.trigger,
            next_run = ?entry.next_run,
            "Schedule added"
        );
        entries.insert(name, entry);
        drop(entries);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Remove a schedule; returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(name).is_some()
        };
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    pub fn enable(&self, name: &str) -> TaskResult<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> TaskResult<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> TaskResult<()> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| TaskError::InvalidSchedule(format!("unknown schedule '{name}'")))?;
            entry.enabled = enabled;
            if enabled && entry.next_run.is_none() {
                entry.next_run = self.compute_next_run(entry, Utc::now());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// All schedule entries as plain data
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(name, entry)| ScheduleEntry {
                name: name.clone(),
                task_name: entry.signature.task_name.clone(),
                trigger: entry.trigger.clone(),
                enabled: entry.enabled,
                last_run: entry.last_run,
                next_run: entry.next_run,
            })
            .collect()
    }

    fn compute_next_run(&self, entry: &Entry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &entry.trigger {
            Trigger::Interval(interval) => {
                let base = entry.last_run.unwrap_or(now);
                chrono::Duration::from_std(*interval)
                    .ok()
                    .and_then(|d| base.checked_add_signed(d))
            }
            Trigger::Cron(_) => {
                let schedule = entry.schedule.as_ref()?;
                match self.config.timezone {
                    SchedulerTimezone::Utc => schedule.after(&now).next(),
                    SchedulerTimezone::Local => schedule
                        .after(&now.with_timezone(&Local))
                        .next()
                        .map(|t| t.with_timezone(&Utc)),
                }
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!("Scheduler loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let (due, earliest) = {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                let mut due = Vec::new();
                for (name, entry) in entries.iter_mut() {
                    if !entry.enabled {
                        continue;
                    }
                    if entry.next_run.map(|t| t <= now).unwrap_or(false) {
                        entry.last_run = Some(now);
                        entry.next_run = self.compute_next_run(entry, now);
                        due.push((name.clone(), entry.signature.clone()));
                    }
                }
                let earliest = entries
                    .values()
                    .filter(|e| e.enabled)
                    .filter_map(|e| e.next_run)
                    .min();
                (due, earliest)
            };

            for (name, signature) in due {
                let task = signature.into_task();
                tracing::debug!(schedule = %name, task_id = %task.id, "Submitting scheduled task");
                if let Err(e) = self.client.submit_task(task).await {
                    tracing::warn!(schedule = %name, error = %e, "Scheduled submission failed");
                }
            }

            let sleep_for = earliest
                .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_secs(60))
                .min(Duration::from_secs(60));

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => {}
            }
        }
        tracing::debug!("Scheduler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryResultBackend, ResultBackend};
    use crate::monitor::EventDispatcher;
    use crate::queue::{TaskQueue, TaskQueueConfig};
    use hermod_bus::{TokioExecutor, ValueContainer};

    fn client() -> (TaskClient, Arc<TaskQueue>) {
        let backend = Arc::new(InMemoryResultBackend::new());
        let backend_dyn: Arc<dyn ResultBackend> = backend;
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default(), backend_dyn.clone()));
        let client = TaskClient::new(
            queue.clone(),
            backend_dyn,
            Arc::new(TokioExecutor),
            Arc::new(EventDispatcher::new()),
        );
        (client, queue)
    }

    fn signature() -> TaskSignature {
        TaskSignature::new("tick", ValueContainer::new())
    }

    #[test]
    fn test_parse_cron_valid() {
        for expr in [
            "* * * * *",
            "0 12 * * *",
            "*/5 * * * *",
            "0 9-17 * * 1-5",
            "15,45 3 1 1,6 *",
        ] {
            assert!(parse_cron(expr).is_ok(), "'{expr}' should parse");
        }
    }

    #[test]
    fn test_parse_cron_invalid() {
        for expr in ["", "* * * *", "* * * * * *", "61 * * * *", "bogus"] {
            assert!(
                matches!(parse_cron(expr), Err(TaskError::InvalidSchedule(_))),
                "'{expr}' should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_add_remove_entries() {
        let (client, _) = client();
        let scheduler = Scheduler::new(SchedulerConfig::default(), client);

        scheduler
            .add_interval("tick", signature(), Duration::from_secs(60))
            .unwrap();
        scheduler
            .add_cron("nightly", signature(), "0 3 * * *")
            .unwrap();

        // Duplicate names rejected
        assert!(scheduler
            .add_interval("tick", signature(), Duration::from_secs(1))
            .is_err());

        let entries = scheduler.entries();
        assert_eq!(entries.len(), 2);
        let tick = entries.iter().find(|e| e.name == "tick").unwrap();
        assert!(tick.enabled);
        assert!(tick.next_run.is_some());
        assert!(tick.last_run.is_none());

        assert!(scheduler.remove("tick"));
        assert!(!scheduler.remove("tick"));
    }

    #[tokio::test]
    async fn test_interval_next_run() {
        let (client, _) = client();
        let scheduler = Scheduler::new(SchedulerConfig::default(), client);
        scheduler
            .add_interval("tick", signature(), Duration::from_secs(30))
            .unwrap();

        let entry = &scheduler.entries()[0];
        let next = entry.next_run.unwrap();
        let expected = Utc::now() + chrono::Duration::seconds(30);
        assert!((next - expected).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn test_cron_next_run_on_minute_boundary() {
        let (client, _) = client();
        let scheduler = Scheduler::new(SchedulerConfig::default(), client);
        scheduler.add_cron("minutely", signature(), "* * * * *").unwrap();

        let next = scheduler.entries()[0].next_run.unwrap();
        assert_eq!(next.timestamp_subsec_millis(), 0);
        assert!(next > Utc::now());
        assert!(next <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn test_disabled_entry_not_due() {
        let (client, _) = client();
        let scheduler = Scheduler::new(SchedulerConfig::default(), client);
        scheduler
            .add_interval("tick", signature(), Duration::from_secs(1))
            .unwrap();
        scheduler.disable("tick").unwrap();
        assert!(!scheduler.entries()[0].enabled);
        scheduler.enable("tick").unwrap();
        assert!(scheduler.entries()[0].enabled);
        assert!(scheduler.enable("missing").is_err());
    }

    #[tokio::test]
    async fn test_interval_schedule_fires() {
        let (client, queue) = client();
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default(), client));
        let executor: Arc<dyn Executor> = Arc::new(TokioExecutor);
        scheduler.start(&executor);

        scheduler
            .add_interval("fast", signature(), Duration::from_millis(50))
            .unwrap();

        // Two firings within half a second
        let mut fired = 0;
        for _ in 0..2 {
            if queue
                .dequeue(&["default".to_string()], Duration::from_millis(500))
                .await
                .is_ok()
            {
                fired += 1;
            }
        }
        assert_eq!(fired, 2);

        let entry = &scheduler.entries()[0];
        assert!(entry.last_run.is_some());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_schedule_change_wakes_loop() {
        let (client, queue) = client();
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default(), client));
        let executor: Arc<dyn Executor> = Arc::new(TokioExecutor);
        scheduler.start(&executor);

        // The loop is asleep with nothing scheduled (60s fallback). Adding
        // a near-term entry must take effect without waiting that out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler
            .add_interval("quick", signature(), Duration::from_millis(40))
            .unwrap();

        let task = queue
            .dequeue(&["default".to_string()], Duration::from_millis(500))
            .await;
        assert!(task.is_ok());
        scheduler.stop();
    }
}
