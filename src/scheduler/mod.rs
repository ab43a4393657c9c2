//! Shared worker pool for background tasks.
//!
//! Tasks declare a typed priority (reader, writer, auxiliary-IO, non-IO),
//! an interval, and how long a single run is expected to take; the
//! scheduler runs them cooperatively and warns when a run overstays its
//! declared budget. Ordering between unrelated tasks is unspecified.
//! Shutdown signals every task and waits for outstanding runs to complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Thread-pool class a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Reader,
    Writer,
    AuxIo,
    NonIo,
}

/// What the task wants after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    /// Reschedule after the task's interval.
    Continue,
    /// The task is finished; its timer loop exits.
    Done,
}

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// One-line description for stats output
    fn description(&self) -> String {
        self.name().to_string()
    }

    /// How often to run this task
    fn interval(&self) -> Duration;

    fn priority(&self) -> TaskPriority {
        TaskPriority::NonIo
    }

    /// Budget for one run; exceeding it is logged, not enforced
    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<TaskControl>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Longest observed delay between a task becoming due and starting,
    /// in nanoseconds.
    max_sched_time_ns: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
            max_sched_time_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        self
    }

    /// Spawn one-off task
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "one-off task failed");
            }
        });
    }

    /// Longest observed scheduling delay so far.
    pub fn max_sched_time(&self) -> Duration {
        Duration::from_nanos(self.max_sched_time_ns.load(Ordering::Relaxed))
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_sched = Arc::clone(&self.max_sched_time_ns);
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so intervals are
            // measured from registration.
            ticker.tick().await;

            loop {
                tokio::select! {
                    tick = ticker.tick() => {
                        let sched_delay = tick.elapsed();
                        max_sched.fetch_max(sched_delay.as_nanos() as u64, Ordering::Relaxed);

                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        let started = std::time::Instant::now();
                        match task.execute(ctx).await {
                            Ok(TaskControl::Continue) => {}
                            Ok(TaskControl::Done) => {
                                tracing::info!(task = task.name(), "task finished");
                                break;
                            }
                            Err(e) => {
                                tracing::error!(
                                    task = task.name(),
                                    error = %e,
                                    "task execution failed"
                                );
                            }
                        }
                        let elapsed = started.elapsed();
                        if elapsed > task.max_expected_duration() {
                            tracing::warn!(
                                task = task.name(),
                                priority = ?task.priority(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "task run exceeded its expected duration"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(&self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        // Wait for all tasks to complete
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in handles {
            task.await?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
