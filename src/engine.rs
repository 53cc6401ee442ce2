//! The dispatcher core.
//!
//! An [`Engine`] owns all runtime state: the poll scheduler that drains the
//! per-type Redis lists, the admission-controlled worker pool, the per-type
//! error backoff, the failed-task sink and the shutdown flag. It is shared
//! by reference between the scheduler, the workers and the sink; nothing in
//! here is global.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::admission::Admission;
use crate::backoff::Backoff;
use crate::config::{Config, TaskConfig};
use crate::error::AppResult;
use crate::executor::Executor;
use crate::output::Output;
use crate::queue::{failed_key, work_key, Task, TaskQueue};
use crate::stats::Stats;

struct FailedTask {
    config: TaskConfig,
    task: Task,
}

pub struct Engine {
    shared: Arc<Shared>,
    failed_tx: Option<mpsc::Sender<FailedTask>>,
    scheduler: Option<JoinHandle<()>>,
    sink: Option<JoinHandle<()>>,
}

struct Shared {
    config: Config,
    queue: Arc<dyn TaskQueue>,
    executor: Executor,
    admission: Admission,
    backoffs: ErrorBackoffRegistry,
    stats: Arc<Stats>,
    output: Output,
    shutdown_tx: watch::Sender<bool>,
    workers: TaskTracker,
}

/// Initiates shutdown from outside the engine, e.g. a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Engine {
    pub fn new(
        config: Config,
        queue: Arc<dyn TaskQueue>,
        stats: Arc<Stats>,
        output: Output,
    ) -> AppResult<Self> {
        let executor = Executor::new(&config.tasks)?;

        let limits = config
            .tasks
            .iter()
            .map(|(task_type, task)| (task_type.clone(), task.workers))
            .collect();

        for task_type in config.tasks.keys() {
            stats.init_task(task_type);
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                executor,
                admission: Admission::new(limits),
                backoffs: ErrorBackoffRegistry::new(),
                stats,
                output,
                shutdown_tx,
                workers: TaskTracker::new(),
            }),
            failed_tx: None,
            scheduler: None,
            sink: None,
        })
    }

    /// Spawn the failed-task sink and the poll scheduler. The sink starts
    /// first; it has to outlive every worker.
    pub fn start(&mut self) {
        let (failed_tx, failed_rx) = mpsc::channel(1);

        self.sink = Some(tokio::spawn(failed_task_sink(
            self.shared.clone(),
            failed_rx,
        )));
        self.scheduler = Some(tokio::spawn(poll_scheduler(
            self.shared.clone(),
            failed_tx.clone(),
        )));
        self.failed_tx = Some(failed_tx);
    }

    /// Stop accepting new tasks. Idempotent; the flag never clears again.
    pub fn stop(&self) {
        self.shared.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drain after [`Engine::stop`]: the scheduler exits, in-flight workers
    /// run to completion, then the failed-task channel closes and the sink
    /// finishes flushing.
    pub async fn wait(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.await;
        }

        self.shared.workers.close();
        self.shared.workers.wait().await;
        tracing::debug!("finished task workers");

        // dropping the last sender ends the sink's receive loop
        self.failed_tx.take();
        if let Some(sink) = self.sink.take() {
            let _ = sink.await;
        }
        tracing::debug!("finished failed-task sink");
    }
}

impl Shared {
    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn worker_available(&self, task_type: &str) -> bool {
        !self.is_shutting_down() && self.admission.available(task_type)
    }

    fn claim_worker(&self, task_type: &str) -> bool {
        !self.is_shutting_down() && self.admission.claim(task_type)
    }
}

/// The interval loop checking each task type's list for work. Runs until
/// shutdown; the inter-round delay backs off while idle and resets to the
/// minimum as soon as any round found work.
async fn poll_scheduler(shared: Arc<Shared>, failed_tx: mpsc::Sender<FailedTask>) {
    let config = &shared.config;
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut interval = Backoff::new(
        config.interval_min,
        config.interval_max,
        config.interval_factor,
    );
    let mut first_tick = true;

    'outer: while !shared.is_shutting_down() {
        if !first_tick {
            tokio::select! {
                _ = tokio::time::sleep(interval.next()) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        first_tick = false;

        let mut work_found = false;

        for (task_type, ct) in &config.tasks {
            if shared.is_shutting_down() {
                break 'outer;
            }

            tracing::debug!(task_type = %task_type, "checking for new tasks");

            if !shared.worker_available(task_type) {
                continue;
            }

            let key = work_key(&config.queue_key, task_type);

            let pending = match shared.queue.len(&key).await {
                Ok(pending) => pending,
                Err(err) => {
                    // likely a connectivity problem affecting every type, so
                    // give up on this round and let the next tick retry
                    shared
                        .output
                        .notify_error(format!("fetching queue length failed: {err}"));
                    break;
                }
            };

            if pending == 0 {
                continue;
            }

            // drain entries until the list runs empty or all workers are
            // busy, but no more than twice the worker count per round
            for _ in 0..ct.workers * 2 {
                if !shared.worker_available(task_type) {
                    break;
                }

                let payload = match shared.queue.pop(&key).await {
                    Ok(Some(payload)) => payload,
                    // empty, or a pop error the next round will retry
                    Ok(None) | Err(_) => break,
                };

                tracing::debug!(task_type = %task_type, payload = %payload, "fetched task");

                let task = match Task::decode(&payload) {
                    Ok(task) => task,
                    Err(err) => {
                        shared.output.notify_error(format!(
                            "discarding undecodable task for type \"{task_type}\": {err}\npayload:\n{payload}"
                        ));
                        continue;
                    }
                };

                if !shared.claim_worker(task_type) {
                    break;
                }

                shared.workers.spawn(run_task(
                    shared.clone(),
                    ct.clone(),
                    task,
                    failed_tx.clone(),
                ));
                work_found = true;
            }
        }

        if work_found {
            interval.reset();
        }
    }

    // also reached when the loop stops for any other reason
    shared.shutdown();
    tracing::debug!("finished poll scheduler");
}

/// A single task's lifecycle: optional error-backoff pause, execution,
/// backoff bookkeeping and failure handling.
async fn run_task(
    shared: Arc<Shared>,
    ct: TaskConfig,
    mut task: Task,
    failed_tx: mpsc::Sender<FailedTask>,
) {
    if ct.backoff_enabled {
        shared.backoffs.wait_if_backing_off(&ct).await;
    }

    shared.stats.task_started(&ct.task_type);
    let payload = task.encode().unwrap_or_default();
    tracing::debug!(task_type = %ct.task_type, payload = %payload, "executing task");

    let result = shared.executor.run(&task, &ct).await;

    if ct.backoff_enabled {
        match &result {
            Ok(()) => shared.backoffs.record_success(&ct.task_type),
            Err(_) => shared.backoffs.record_failure(&ct),
        }
    }

    if let Err(err) = result {
        task.error_message = err.to_string();
        let _ = failed_tx
            .send(FailedTask {
                config: ct.clone(),
                task,
            })
            .await;

        shared.output.notify_error(format!(
            "failed executing task for type \"{}\"\npayload:\n{payload}\n\n{err}",
            ct.task_type
        ));
    } else {
        tracing::debug!(task_type = %ct.task_type, payload = %payload, "finished task");
    }

    shared.admission.release(&ct.task_type);
}

/// Consumes failed tasks until the channel closes and persists them into
/// the per-type failed list. Every item is independent; errors are notified
/// and the next item is processed regardless.
async fn failed_task_sink(shared: Arc<Shared>, mut failed_rx: mpsc::Receiver<FailedTask>) {
    while let Some(failed) = failed_rx.recv().await {
        let ct = failed.config;

        if ct.failed_tasks_ttl == 0 {
            continue;
        }

        let key = failed_key(&shared.config.queue_key, &ct.task_type);

        let payload = match failed.task.encode() {
            Ok(payload) => payload,
            Err(err) => {
                shared
                    .output
                    .notify_error(format!("encoding failed task: {err}"));
                continue;
            }
        };

        if let Err(err) = shared
            .queue
            .push_failed(&key, &payload, ct.failed_tasks_ttl)
            .await
        {
            shared.output.notify_error(format!(
                "persisting failed task: {err}\npayload:\n{payload}"
            ));
        }
    }
}

/// Per-type error backoff. After a failure every subsequent worker of that
/// type pauses before executing, with growing delays, until a success
/// resets the state. Entries are created lazily on first use.
struct ErrorBackoffRegistry {
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

struct BackoffEntry {
    backoff: Backoff,
    engaged: bool,
}

impl ErrorBackoffRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Sleeps for the next backoff delay when the type's backoff is
    /// engaged. The delay is computed under the lock, the sleep happens
    /// outside of it.
    async fn wait_if_backing_off(&self, ct: &TaskConfig) {
        let delay = {
            let mut entries = self.entries.lock();
            let entry = Self::entry(&mut entries, ct);
            entry.engaged.then(|| entry.backoff.next())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record_success(&self, task_type: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(task_type) {
            entry.engaged = false;
            entry.backoff.reset();
        }
    }

    fn record_failure(&self, ct: &TaskConfig) {
        let mut entries = self.entries.lock();
        Self::entry(&mut entries, ct).engaged = true;
    }

    fn entry<'a>(
        entries: &'a mut HashMap<String, BackoffEntry>,
        ct: &TaskConfig,
    ) -> &'a mut BackoffEntry {
        entries
            .entry(ct.task_type.clone())
            .or_insert_with(|| BackoffEntry {
                backoff: Backoff::jittered(ct.backoff_min, ct.backoff_max, ct.backoff_factor),
                engaged: false,
            })
    }
}
