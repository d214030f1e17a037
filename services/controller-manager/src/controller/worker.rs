//! Worker pool that drains a controller's work queue through its base.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scf_reconcile::{
    ReconcileError, ReconcileResult, WorkQueue, DEFAULT_ITEM_TIMEOUT, DEFAULT_MAX_RETRIES,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::base::{ControllerBase, WorkAdmission};
use super::health::run_health_loop;
use crate::error::ControllerError;

/// Business logic of one controller type.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Item: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn controller_type(&self) -> &str;

    /// Partition key of the workload `item` belongs to.
    fn workload_key(&self, item: &Self::Item) -> i64;

    /// Converge one item. Must be idempotent.
    async fn reconcile(&self, item: &Self::Item) -> ReconcileResult<()>;
}

/// Decides what happens to an item whose reconcile failed.
pub trait ErrorHandler<K>: Send + Sync
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn handle_err(&self, queue: &WorkQueue<K>, item: &K, err: &ReconcileError);
}

/// Requeue with rate limiting until `max_retries`, then drop.
#[derive(Debug, Clone, Copy)]
pub struct RequeueOnError {
    pub max_retries: u32,
}

impl Default for RequeueOnError {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl<K> ErrorHandler<K> for RequeueOnError
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    fn handle_err(&self, queue: &WorkQueue<K>, item: &K, err: &ReconcileError) {
        let requeues = queue.num_requeues(item);
        if err.is_retryable() && requeues < self.max_retries {
            debug!(?item, error = %err, requeues, "Requeueing failed item");
            queue.add_rate_limited(item.clone());
        } else {
            warn!(?item, error = %err, requeues, "Dropping item after reconcile failure");
            queue.forget(item);
        }
    }
}

/// What a worker does with an item whose key is outside the local range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRangePolicy {
    /// Requeue with rate limiting for whoever owns it later.
    Requeue,
    /// Drop it; the owner will resync.
    Drop,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub worker_count: usize,
    pub item_timeout: Duration,
    pub out_of_range: OutOfRangePolicy,
    /// Delay before retrying an item dequeued while not `Active`.
    pub drain_poll_interval: Duration,
    pub health_report_interval: Duration,
    /// Bound on waiting for workers after shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            out_of_range: OutOfRangePolicy::Requeue,
            drain_poll_interval: Duration::from_millis(100),
            health_report_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs a reconciler on top of a registered [`ControllerBase`].
pub struct ControllerRunner<R: Reconciler> {
    base: Arc<ControllerBase>,
    reconciler: Arc<R>,
    queue: WorkQueue<R::Item>,
    error_handler: Arc<dyn ErrorHandler<R::Item>>,
    config: RunnerConfig,
}

impl<R: Reconciler> ControllerRunner<R> {
    pub fn new(base: Arc<ControllerBase>, reconciler: R, config: RunnerConfig) -> Self {
        Self {
            base,
            reconciler: Arc::new(reconciler),
            queue: WorkQueue::new(),
            error_handler: Arc::new(RequeueOnError::default()),
            config,
        }
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler<R::Item> + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Handle for feeding items to the workers.
    pub fn queue(&self) -> WorkQueue<R::Item> {
        self.queue.clone()
    }

    pub fn base(&self) -> &Arc<ControllerBase> {
        &self.base
    }

    /// Run supervisor, workers and health reporting until shutdown.
    ///
    /// On return the queue is shut down and the instance deregistered.
    /// Fatal supervisor errors are returned after teardown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let worker_count = self.config.worker_count.max(1);
        info!(
            controller_type = %self.reconciler.controller_type(),
            instance = %self.base.name(),
            worker_count,
            "Starting controller"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let health = tokio::spawn(run_health_loop(
            Arc::clone(&self.base),
            self.config.health_report_interval,
            stop_rx.clone(),
        ));

        let shared = Arc::new(self);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let runner = Arc::clone(&shared);
            let stop = stop_rx.clone();
            workers.spawn(async move { runner.worker(id, stop).await });
        }

        let result = Arc::clone(&shared.base).run(shutdown).await;
        if let Err(e) = &result {
            error!(instance = %shared.base.name(), error = %e, "Controller supervisor failed");
        }

        let _ = stop_tx.send(true);
        shared.queue.shut_down();
        let drained = tokio::time::timeout(shared.config.shutdown_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(instance = %shared.base.name(), "Workers did not stop in time, aborting");
            workers.abort_all();
        }
        let _ = health.await;

        if let Err(e) = shared.base.deregister().await {
            warn!(instance = %shared.base.name(), error = %e, "Failed to deregister");
        }
        info!(instance = %shared.base.name(), "Controller stopped");
        result
    }

    async fn worker(&self, id: usize, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                ready = self.base.wait_until_active() => {
                    if ready.is_err() {
                        break;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }

            let Some(item) = self.queue.get().await else {
                break;
            };
            self.process(item).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn process(&self, item: R::Item) {
        let key = self.reconciler.workload_key(&item);
        match self.base.begin_work_item(key) {
            WorkAdmission::Admitted(guard) => {
                self.base.track_workload(key);
                let result = match tokio::time::timeout(
                    self.config.item_timeout,
                    self.reconciler.reconcile(&item),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::Timeout {
                        resource: format!("{item:?}"),
                        elapsed: self.config.item_timeout,
                    }),
                };
                drop(guard);

                match result {
                    Ok(()) => self.queue.forget(&item),
                    Err(e) => self.error_handler.handle_err(&self.queue, &item, &e),
                }
            }
            WorkAdmission::OutOfRange => match self.config.out_of_range {
                OutOfRangePolicy::Requeue => {
                    debug!(?item, key, "Item out of range, requeueing");
                    self.queue.add_rate_limited(item.clone());
                }
                OutOfRangePolicy::Drop => {
                    debug!(?item, key, "Item out of range, dropping");
                    self.queue.forget(&item);
                }
            },
            WorkAdmission::NotActive => {
                self.queue.add_after(item.clone(), self.config.drain_poll_interval);
            }
        }
        self.queue.done(&item);
    }
}
