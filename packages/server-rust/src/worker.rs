//! Background worker: a single consumer loop over an mpsc task channel.
//!
//! The coordinator funnels every intake delivery through one
//! `BackgroundWorker`, which gives registry mutations and dispatch
//! decisions a single logical thread of control -- no locking discipline
//! needed beyond the channel itself. The periodic tick doubles as the
//! registry autosave timer.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for task handlers executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is stopping. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// Single-consumer task worker with a periodic tick.
///
/// Spawns one tokio task that drains the channel, calls
/// [`BackgroundRunnable::run`] per task, fires
/// [`BackgroundRunnable::on_tick`] at the configured interval, and calls
/// [`BackgroundRunnable::shutdown`] once on stop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker with a task channel of `capacity` and the given
    /// tick interval.
    pub fn start(mut runnable: R, capacity: usize, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(task) => runnable.run(task).await,
                            None => break, // Channel closed.
                        }
                    }
                    _ = tick.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// A cloneable sender for feeding tasks from pump loops.
    ///
    /// Returns `None` once the worker has been stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// Submits a task, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker gracefully and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_count: Arc<AtomicU32>,
    }

    impl CountingRunnable {
        fn new() -> (Self, Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
            let run = Arc::new(AtomicU32::new(0));
            let tick = Arc::new(AtomicU32::new(0));
            let shutdown = Arc::new(AtomicU32::new(0));
            (
                Self {
                    run_count: run.clone(),
                    tick_count: tick.clone(),
                    shutdown_count: shutdown.clone(),
                },
                run,
                tick,
                shutdown,
            )
        }
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_submitted_tasks_then_shuts_down() {
        let (runnable, runs, _ticks, shutdowns) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, 16, Duration::from_secs(60));

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let (runnable, _runs, ticks, _shutdowns) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, 16, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(110)).await;
        worker.stop().await;

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_errors() {
        let (runnable, _runs, _ticks, _shutdowns) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, 16, Duration::from_secs(60));
        worker.stop().await;

        assert!(worker.submit(1).await.is_err());
        assert!(worker.sender().is_none());
    }

    #[tokio::test]
    async fn sender_feeds_the_same_worker() {
        let (runnable, runs, _ticks, _shutdowns) = CountingRunnable::new();
        let mut worker = BackgroundWorker::start(runnable, 16, Duration::from_secs(60));

        let tx = worker.sender().unwrap();
        tx.send(7).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        worker.stop().await;
    }
}
