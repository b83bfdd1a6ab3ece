use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically. The tablet registers one
/// task per pool concern: gc ticks, binlog fsync, binlog truncation, snapshot
/// scheduling, recycle sweeps, disk-used sampling and keep-alive.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().unwrap().push(handle);
        self
    }

    /// Spawn a one-off async task.
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "One-off task failed");
            }
        });
    }

    /// Spawn a one-off blocking task. Long-running ops (load, drop,
    /// make-snapshot, send-snapshot) do synchronous file IO and run here.
    pub fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = f() {
                tracing::error!(error = %e, "Blocking task failed");
            }
        });
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a freshly loaded
            // tablet does not gc/truncate before replay settles.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        for task in self.tasks.write().unwrap().drain(..) {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let count_before_shutdown = counter.load(Ordering::SeqCst);
        scheduler.shutdown().await?;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let count_after_shutdown = counter.load(Ordering::SeqCst);

        assert_eq!(count_before_shutdown, count_after_shutdown);
        Ok(())
    }
}
