//! A [`Scheduler`] running on tokio timers.
//!
//! Periodic schedules tick on a fixed interval; cron schedules sleep until
//! the next time the expression yields. Clustered ticks first take a lock in
//! the shared [`KvStore`], so only one process of the cluster runs each tick.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workflow::{Context, FlowError};

use crate::definition::Schedule;
use crate::services::{ScheduledTask, Scheduler};
use crate::storage::KvStore;

/// How long a cron tick keeps its cluster lock.
const CRON_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct TokioScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Shared lock store for clustered schedules; without one every process
    /// runs every tick.
    locks: Option<Arc<dyn KvStore>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_store(mut self, locks: Arc<dyn KvStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Cancel every scheduled task.
    pub fn clear(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_task(
        &self,
        task_id: &str,
        schedule: &Schedule,
        task: Arc<dyn ScheduledTask>,
        ctx: &Context,
    ) -> Result<(), FlowError> {
        schedule.validate()?;

        let tick = Tick {
            task_id: task_id.to_owned(),
            task,
            locks: schedule
                .is_clustered()
                .then(|| self.locks.clone())
                .flatten(),
            ctx: ctx.clone(),
        };

        let handle = match schedule {
            Schedule::Periodic {
                interval_seconds,
                repeat_count,
                start_time,
                ..
            } => {
                let interval = Duration::from_secs(*interval_seconds);
                let delay = start_time
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                tokio::spawn(run_periodic(tick, delay, interval, *repeat_count))
            }
            Schedule::Cron { expression, .. } => {
                let cron = cron::Schedule::from_str(expression)
                    .map_err(|e| FlowError::InvalidSchedule(format!("'{expression}': {e}")))?;
                tokio::spawn(run_cron(tick, cron))
            }
        };

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_owned(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(task_id, kind = schedule.kind_name(), clustered = schedule.is_clustered(), "task scheduled");
        Ok(())
    }

    fn remove_scheduled_task(&self, task_id: &str, _ctx: &Context) -> Result<(), FlowError> {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
        if let Some(handle) = removed {
            handle.abort();
            info!(task_id, "scheduled task removed");
        }
        Ok(())
    }

    fn has_task(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .is_some_and(|handle| !handle.is_finished())
    }
}

// ---------------------------------------------------------------------------
// Timer loops
// ---------------------------------------------------------------------------

struct Tick {
    task_id: String,
    task: Arc<dyn ScheduledTask>,
    locks: Option<Arc<dyn KvStore>>,
    ctx: Context,
}

impl Tick {
    /// Run the task once, unless another process holds the lock for `slot`.
    async fn fire(&self, slot: i64, lock_ttl: Duration) {
        if let Some(locks) = &self.locks {
            let key = format!("schedule:{}:{}", self.task_id, slot);
            match locks.lock(&key, Some(lock_ttl)).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id = %self.task_id, slot, "tick taken by another process");
                    return;
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, error = %e, "could not take the cluster lock, tick skipped");
                    return;
                }
            }
        }

        let mut ctx = self.ctx.clone();
        ctx.set_info("scheduledTask", self.task_id.clone());
        self.task.run(&self.task_id, ctx).await;
    }
}

async fn run_periodic(tick: Tick, delay: Duration, interval: Duration, repeat_count: u64) {
    tokio::time::sleep(delay).await;

    let mut timer = tokio::time::interval(interval);
    let mut runs = 0u64;
    let interval_secs = interval.as_secs().max(1) as i64;

    loop {
        timer.tick().await;
        tick.fire(Utc::now().timestamp() / interval_secs, interval).await;

        runs += 1;
        if repeat_count != 0 && runs >= repeat_count {
            info!(task_id = %tick.task_id, runs, "periodic task completed");
            break;
        }
    }
}

async fn run_cron(tick: Tick, cron: cron::Schedule) {
    while let Some(next) = cron.upcoming(Utc).next() {
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(task_id = %tick.task_id, fire_at = %next, "next cron tick");

        tokio::time::sleep(delay).await;
        tick.fire(next.timestamp(), CRON_LOCK_TTL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::storage::MemoryKvStore;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl ScheduledTask for Counter {
        async fn run(&self, _task_id: &str, _ctx: Context) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn periodic(repeat_count: u64, clustered: bool) -> Schedule {
        Schedule::Periodic {
            interval_seconds: 10,
            repeat_count,
            start_time: None,
            clustered,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_stops_after_repeat_count() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(Counter::default());

        scheduler
            .schedule_task("it-1", &periodic(3, false), counter.clone(), &Context::default())
            .expect("scheduled");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        assert!(!scheduler.has_task("it-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn removed_task_no_longer_fires() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(Counter::default());
        let ctx = Context::default();

        scheduler
            .schedule_task("it-1", &periodic(0, false), counter.clone(), &ctx)
            .expect("scheduled");
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(scheduler.has_task("it-1"));

        scheduler.remove_scheduled_task("it-1", &ctx).expect("removed");
        let fired = counter.0.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(counter.0.load(Ordering::SeqCst), fired);
        assert!(!scheduler.has_task("it-1"));
    }

    #[tokio::test]
    async fn clustered_tick_runs_once_per_lock_store() {
        let locks: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let counter = Arc::new(Counter::default());

        for _ in 0..2 {
            let tick = Tick {
                task_id: "it-1".into(),
                task: counter.clone(),
                locks: Some(locks.clone()),
                ctx: Context::default(),
            };
            tick.fire(42, Duration::from_secs(10)).await;
        }

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let scheduler = TokioScheduler::new();
        let err = scheduler
            .schedule_task(
                "it-1",
                &Schedule::Cron { expression: "not cron".into(), clustered: true },
                Arc::new(Counter::default()),
                &Context::default(),
            )
            .expect_err("bad expression");
        assert_eq!(err.code(), "SCH_INVALID");
    }
}
