//! Process-wide retry worker shared by every failback registry
//!
//! One tokio task drives all scheduled retries, each at its own period.
//! The worker is started explicitly and must be stopped by whoever owns it.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Work replayed periodically by the scheduler
#[async_trait]
pub trait RetryTask: Send + Sync {
    fn name(&self) -> String;

    async fn retry(&self);
}

struct Scheduled {
    task: Weak<dyn RetryTask>,
    period: Duration,
    next: Instant,
}

#[derive(Default)]
struct SchedulerState {
    tasks: Mutex<Vec<Scheduled>>,
    changed: Notify,
}

pub struct RetryScheduler {
    state: Arc<SchedulerState>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Spawn the worker on the current tokio runtime
    pub fn start() -> Self {
        let state = Arc::new(SchedulerState::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(state.clone(), shutdown_rx));
        info!("retry scheduler started");

        Self {
            state,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Run `task` every `period` until it is dropped or the scheduler stops.
    /// Only a weak reference is held.
    pub fn schedule(&self, task: Weak<dyn RetryTask>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        if let Ok(mut tasks) = self.state.tasks.lock() {
            tasks.push(Scheduled {
                task,
                period,
                next: Instant::now() + period,
            });
        }
        self.state.changed.notify_one();
    }

    pub fn scheduled_count(&self) -> usize {
        self.state
            .tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|t| t.task.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
            info!("retry scheduler stopped");
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_worker(state: Arc<SchedulerState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let deadline = next_deadline(&state);

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = state.changed.notified() => continue,
            _ = sleep_until(deadline) => {}
        }

        for task in take_due(&state) {
            debug!(task = %task.name(), "running retry");
            task.retry().await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn next_deadline(state: &SchedulerState) -> Option<Instant> {
    state
        .tasks
        .lock()
        .ok()
        .and_then(|tasks| tasks.iter().map(|t| t.next).min())
}

/// Due tasks in scheduling order; dropped tasks are forgotten
fn take_due(state: &SchedulerState) -> Vec<Arc<dyn RetryTask>> {
    let Ok(mut tasks) = state.tasks.lock() else {
        return Vec::new();
    };
    let now = Instant::now();
    tasks.retain(|t| t.task.strong_count() > 0);

    let mut due = Vec::new();
    for scheduled in tasks.iter_mut() {
        if scheduled.next <= now {
            scheduled.next = now + scheduled.period;
            if let Some(task) = scheduled.task.upgrade() {
                due.push(task);
            }
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl RetryTask for Counter {
        fn name(&self) -> String {
            "counter".to_string()
        }

        async fn retry(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_runs_tasks_periodically() {
        let scheduler = RetryScheduler::start();
        let fast = Arc::new(Counter(AtomicUsize::new(0)));
        let slow = Arc::new(Counter(AtomicUsize::new(0)));
        let fast_task: Arc<dyn RetryTask> = fast.clone();
        let slow_task: Arc<dyn RetryTask> = slow.clone();
        scheduler.schedule(Arc::downgrade(&fast_task), Duration::from_millis(10));
        scheduler.schedule(Arc::downgrade(&slow_task), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(fast.0.load(Ordering::SeqCst) >= 3);
        assert_eq!(slow.0.load(Ordering::SeqCst), 0);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_halts_retries() {
        let scheduler = RetryScheduler::start();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task: Arc<dyn RetryTask> = counter.clone();
        scheduler.schedule(Arc::downgrade(&task), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop().await;
        let after_stop = counter.0.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_dropped_tasks_are_forgotten() {
        let scheduler = RetryScheduler::start();
        let task: Arc<dyn RetryTask> = Arc::new(Counter(AtomicUsize::new(0)));
        scheduler.schedule(Arc::downgrade(&task), Duration::from_millis(5));
        assert_eq!(scheduler.scheduled_count(), 1);

        drop(task);
        assert_eq!(scheduler.scheduled_count(), 0);
        scheduler.stop().await;
    }
}
