//! The queue manager: one submission worker over a FIFO store, a halt/resume
//! gate for throttle backpressure, per-task poll sessions, and an expiry
//! sweeper for requests that waited too long.
//!
//! All shared state lives in a single [`Inner`] behind an `Arc`; the worker,
//! sweeper, resume timer, and poll sessions read current state through it
//! rather than through values captured at spawn time.

mod halt;
mod poll;
mod sweep;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::GenerationClient;
use crate::request::{
    ErrorFn, ExpiredFn, GenerationInput, Hooks, Queued, Request, StatusEvent, TargetId, TaskHandle,
};
use halt::HaltController;
use poll::PollInfo;

/// Configuration for the queue manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Timeout for one submission attempt in milliseconds
    pub submit_timeout_ms: u64,

    /// How long the queue stays halted after a throttle signal before the
    /// resume timer fires (milliseconds). Any in-flight task resolving
    /// resumes the queue earlier.
    pub halt_cooldown_ms: u64,

    /// Fixed interval between status queries of one poll session (milliseconds)
    pub poll_interval_ms: u64,

    /// Maximum status queries per poll session before the task is reported
    /// as timed out
    pub max_poll_attempts: u32,

    /// How often the expiry sweeper scans the queue (milliseconds)
    pub sweep_interval_ms: u64,

    /// Maximum time a record may wait in the queue before the sweeper
    /// evicts it (milliseconds)
    pub max_queue_age_ms: u64,

    /// Interval for logging queue status (milliseconds)
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 60_000,
            halt_cooldown_ms: 30_000,
            poll_interval_ms: 15_000,
            max_poll_attempts: 20, // ~5 minutes at the default interval
            sweep_interval_ms: 30_000,
            max_queue_age_ms: 30 * 60 * 1000,
            status_log_interval_ms: Some(2000),
        }
    }
}

/// Snapshot of the manager's current state and cumulative counters.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Records waiting in the queue store (excludes the claimed record).
    pub queued: usize,
    /// Target currently mid-submission, if any.
    pub claimed: Option<TargetId>,
    /// Poll sessions tracking accepted tasks.
    pub active_polls: usize,
    /// Whether the submission gate is currently halted.
    pub halted: bool,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub expired: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) expired: AtomicU64,
}

/// The queue store proper: pending records in FIFO order, plus the target of
/// the record the worker has claimed for submission. A claimed record is out
/// of the deque, so the sweeper can never evict a record mid-submission.
#[derive(Default)]
pub(crate) struct QueueStore {
    pub(crate) records: VecDeque<Request<Queued>>,
    pub(crate) claimed: Option<TargetId>,
}

/// Shared state read by every background task through the same `Arc`.
pub(crate) struct Inner<C: GenerationClient> {
    pub(crate) client: C,
    pub(crate) config: ManagerConfig,
    pub(crate) queue: Mutex<QueueStore>,
    pub(crate) halt: HaltController,
    pub(crate) wake: Arc<Notify>,
    pub(crate) sessions: DashMap<TaskHandle, PollInfo>,
    pub(crate) fallback_error: Mutex<ErrorFn>,
    pub(crate) on_expired: Mutex<Option<ExpiredFn>>,
    pub(crate) counters: Counters,
}

fn default_fallback_error() -> ErrorFn {
    Arc::new(|message| {
        tracing::error!(error = %message, "Generation request failed with no error handler");
    })
}

/// Manager for a FIFO queue of generation requests.
///
/// One worker submits the head record to the remote service; accepted
/// submissions hand off to independent poll sessions. A throttle response
/// halts the queue, keeping the head record for retry after the cooldown (or
/// earlier, when any in-flight task resolves). A background sweeper evicts
/// records that waited in the queue past the maximum age.
pub struct QueueManager<C: GenerationClient> {
    inner: Arc<Inner<C>>,
}

impl<C: GenerationClient> Clone for QueueManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: GenerationClient + 'static> QueueManager<C> {
    /// Create a manager with the default configuration.
    pub fn new(client: C) -> Self {
        Self::with_config(client, ManagerConfig::default())
    }

    /// Create a manager with an explicit configuration.
    pub fn with_config(client: C, config: ManagerConfig) -> Self {
        let wake = Arc::new(Notify::new());
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                queue: Mutex::new(QueueStore::default()),
                halt: HaltController::new(wake.clone()),
                wake,
                sessions: DashMap::new(),
                fallback_error: Mutex::new(default_fallback_error()),
                on_expired: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Set the handler for terminal failures of requests enqueued without
    /// their own error hook. Defaults to logging at error level.
    pub fn on_fallback_error(self, hook: ErrorFn) -> Self {
        *self.inner.fallback_error.lock() = hook;
        self
    }

    /// Set the handler for batched expiry notifications: one invocation per
    /// sweep, listing every target evicted in that sweep. Without a handler,
    /// expiries are routed through the fallback error handler as a single
    /// message.
    pub fn on_expired(self, hook: ExpiredFn) -> Self {
        *self.inner.on_expired.lock() = Some(hook);
        self
    }

    /// Append a request to the tail of the queue and wake the worker.
    ///
    /// Fires `StatusEvent::Queued` through the request's update hook before
    /// the record becomes visible to the worker, so the queued event always
    /// precedes any later event for the same request. No duplicate-target
    /// validation is performed: a second enqueue for the same target creates
    /// a second independent record.
    pub fn enqueue(&self, input: GenerationInput, hooks: Hooks) {
        let record = Request::enqueue(input, hooks);
        tracing::info!(
            request_id = %record.data.id,
            target_id = %record.data.target_id,
            "Enqueued generation request"
        );
        (record.data.hooks.on_update)(StatusEvent::Queued);
        self.inner.queue.lock().records.push_back(record);
        self.inner.wake.notify_one();
    }

    /// Enqueue several requests so that all of them are visible in the store
    /// before the worker starts on any of them.
    pub fn enqueue_batch(&self, batch: Vec<(GenerationInput, Hooks)>) {
        let records: Vec<Request<Queued>> = batch
            .into_iter()
            .map(|(input, hooks)| Request::enqueue(input, hooks))
            .collect();
        tracing::info!(count = records.len(), "Enqueued generation request batch");
        for record in &records {
            (record.data.hooks.on_update)(StatusEvent::Queued);
        }
        {
            let mut store = self.inner.queue.lock();
            for record in records {
                store.records.push_back(record);
            }
        }
        self.inner.wake.notify_one();
    }

    /// Snapshot the queue state and cumulative counters.
    pub fn stats(&self) -> ManagerStats {
        let (queued, claimed) = {
            let store = self.inner.queue.lock();
            (store.records.len(), store.claimed.clone())
        };
        ManagerStats {
            queued,
            claimed,
            active_polls: self.inner.sessions.len(),
            halted: self.inner.halt.is_halted(),
            submitted: self.inner.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.inner.counters.succeeded.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            timed_out: self.inner.counters.timed_out.load(Ordering::Relaxed),
            expired: self.inner.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background tasks: the submission worker, the expiry
    /// sweeper, and (if configured) periodic status logging. Call once.
    ///
    /// Returns the worker's join handle; cancelling `shutdown` stops all
    /// spawned tasks, aborting in-flight poll sessions without firing their
    /// callbacks.
    pub fn run(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        if let Some(interval_ms) = self.inner.config.status_log_interval_ms {
            let inner = self.inner.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let (queued, claimed) = {
                                let store = inner.queue.lock();
                                (store.records.len(), store.claimed.is_some())
                            };
                            tracing::debug!(
                                queued,
                                claimed,
                                active_polls = inner.sessions.len(),
                                halted = inner.halt.is_halted(),
                                "Queue status"
                            );
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }

        sweep::spawn(self.inner.clone(), shutdown.clone());

        tokio::spawn(worker_loop(self.inner.clone(), shutdown))
    }
}

/// The single submission worker.
///
/// This task is the reentrancy guard: it is the only code path that submits,
/// and it holds the claimed record across the whole submit call, so two
/// submissions can never race on the same head. It sleeps on the wake signal
/// whenever the queue is empty or halted; every enqueue, resume, and poll
/// completion re-triggers the readiness check.
#[tracing::instrument(skip_all)]
async fn worker_loop<C: GenerationClient + 'static>(
    inner: Arc<Inner<C>>,
    shutdown: CancellationToken,
) {
    tracing::info!("Submission worker started");
    loop {
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown signal received, stopping worker");
                return;
            }
            let ready = !inner.halt.is_halted() && !inner.queue.lock().records.is_empty();
            if ready {
                break;
            }
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping worker");
                    return;
                }
            }
        }

        // Move the head out of the sweepable store for the whole submission.
        let claimed = {
            let mut store = inner.queue.lock();
            let Some(record) = store.records.pop_front() else {
                continue;
            };
            let claimed = record.claim();
            store.claimed = Some(claimed.data.target_id.clone());
            claimed
        };

        let submitted = inner
            .client
            .submit(&claimed.data, inner.config.submit_timeout_ms)
            .await;
        inner.queue.lock().claimed = None;

        match submitted {
            Ok(task) => {
                inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                poll::spawn(inner.clone(), claimed.into_polling(task), shutdown.clone());
            }
            Err(err) if err.is_throttle() => {
                tracing::warn!(
                    target_id = %claimed.data.target_id,
                    error = %err,
                    "Submission throttled, keeping record at queue head"
                );
                inner.queue.lock().records.push_front(claimed.release());
                inner.halt.engage(
                    Duration::from_millis(inner.config.halt_cooldown_ms),
                    shutdown.clone(),
                );
            }
            Err(err) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                let fallback = inner.fallback_error.lock().clone();
                claimed.fail(&err.to_string(), &fallback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::client::MockGenerationClient;
    use crate::request::UpdateFn;

    fn noop_update() -> UpdateFn {
        Arc::new(|_| {})
    }

    fn input(target: &str) -> GenerationInput {
        GenerationInput {
            target_id: target.into(),
            source_ref: "aGVsbG8=".to_string(),
            instruction: "slow pan".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_fires_queued_event_before_the_record_is_visible() {
        let manager = QueueManager::new(MockGenerationClient::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        manager.enqueue(
            input("S1"),
            Hooks::new(Arc::new(move |event| sink.lock().push(event))),
        );

        assert!(matches!(events.lock().as_slice(), [StatusEvent::Queued]));
        let stats = manager.stats();
        assert_eq!(stats.queued, 1);
        assert!(!stats.halted);
    }

    #[tokio::test]
    async fn enqueue_batch_makes_all_records_visible_together() {
        let manager = QueueManager::new(MockGenerationClient::new());
        let queued_events = Arc::new(AtomicU64::new(0));

        let batch = ["S1", "S2", "S3"]
            .into_iter()
            .map(|target| {
                let count = queued_events.clone();
                (
                    input(target),
                    Hooks::new(Arc::new(move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    })),
                )
            })
            .collect();
        manager.enqueue_batch(batch);

        assert_eq!(queued_events.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().queued, 3);
    }

    #[test]
    fn sweep_evicts_only_over_age_records() {
        let manager = QueueManager::new(MockGenerationClient::new());
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let manager =
            manager.on_expired(Arc::new(move |targets: &[TargetId]| {
                sink.lock().push(targets.to_vec())
            }));

        let fresh = Request::enqueue(input("S-young"), Hooks::new(noop_update()));
        let mut stale = Request::enqueue(input("S-old"), Hooks::new(noop_update()));
        stale.state.enqueued_at = Utc::now() - chrono::Duration::minutes(31);
        {
            let mut store = manager.inner.queue.lock();
            store.records.push_back(stale);
            store.records.push_back(fresh);
        }

        sweep::sweep(&manager.inner);

        assert_eq!(batches.lock().as_slice(), [vec![TargetId::from("S-old")]]);
        let stats = manager.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.expired, 1);

        // A second sweep finds nothing and fires no notification.
        sweep::sweep(&manager.inner);
        assert_eq!(batches.lock().len(), 1);
    }
}
