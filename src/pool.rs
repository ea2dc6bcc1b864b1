//! Provides the bounded background pool which executes cache rebuild tasks.
//!
//! The logical-expiry strategy never blocks its caller: rebuild work is handed to this
//! pool instead. The pool consists of a fixed number of workers draining a bounded queue.
//! If the queue is full, the submitting task executes the work itself - back-pressure
//! degrades to synchronous execution rather than dropping a rebuild on the floor.
//!
//! The pool is an explicit, injected resource with shutdown and drain semantics - it is
//! never hidden behind a static. [install](install) creates it from the system config and
//! registers it in the platform.
use crate::config::Config;
use crate::platform::Platform;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// The unit of work accepted by the pool.
pub type Task = BoxFuture<'static, ()>;

/// A fixed-size worker pool over a bounded task queue.
///
/// # Example
///
/// ```
/// # use palisade::pool::CachePool;
/// # #[tokio::main]
/// # async fn main() {
/// let pool = CachePool::new(2, 64);
///
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// pool.submit(Box::pin(async move {
///     let _ = tx.send(42);
/// }))
/// .await;
///
/// assert_eq!(rx.await.unwrap(), 42);
/// pool.shutdown().await;
/// # }
/// ```
pub struct CachePool {
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CachePool {
    /// Creates a pool with the given number of workers and queue capacity.
    ///
    /// Note that this spawns the workers onto the current tokio runtime and therefore has
    /// to be called from within one.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::new();
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // The queue lock is only held while waiting for a task, never while
                    // executing one - workers therefore run tasks concurrently.
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => task.await,
                        None => break,
                    }
                }
                log::debug!("Background worker {} stopped.", worker);
            }));
        }

        CachePool {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Submits a task for background execution.
    ///
    /// If the queue is saturated (or the pool has already been shut down), the task is
    /// executed right here on the caller - work is delayed under pressure, never lost.
    pub async fn submit(&self, task: Task) {
        let sender = self.queue.lock().unwrap().clone();

        match sender {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => (),
                Err(TrySendError::Full(task)) => {
                    log::warn!("The background pool is saturated - executing the task inline.");
                    task.await;
                }
                Err(TrySendError::Closed(task)) => task.await,
            },
            None => task.await,
        }
    }

    /// Shuts the pool down.
    ///
    /// All tasks already queued are still executed; afterwards the workers stop. Tasks
    /// submitted after this call run synchronously on their submitter.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().unwrap().take();
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if let Err(error) = handle.await {
                log::error!("A background worker failed during shutdown: {}", error);
            }
        }

        log::info!("Background pool has been drained and stopped.");
    }
}

/// Creates a pool from the system config and registers it in the platform.
///
/// Reads `pool.workers` and `pool.queue` from the config. This is invoked by the
/// [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: Arc<Platform>) {
    let settings = platform.require::<Config>().current().pool.clone();
    let pool = CachePool::new(settings.workers, settings.queue_size);

    log::info!(
        "Background pool ready ({} workers, queue of {}).",
        settings.workers,
        settings.queue_size
    );
    platform.register::<CachePool>(Arc::new(pool));
}
