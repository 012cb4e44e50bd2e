//! Expiry sweeper for requests that waited in the queue too long.
//!
//! Distinct from a poll timeout: an expired request never got submitted at
//! all. The sweeper scans the whole store on a fixed interval and evicts
//! over-age records wherever they sit, delivering one batched notification
//! per sweep. The record the worker is currently submitting lives outside
//! the store, so a mid-submission record can never be swept.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::client::GenerationClient;
use crate::request::TargetId;

pub(super) fn spawn<C: GenerationClient + 'static>(
    inner: Arc<Inner<C>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(inner.config.sweep_interval_ms));
        tracing::debug!(
            interval_ms = inner.config.sweep_interval_ms,
            max_queue_age_ms = inner.config.max_queue_age_ms,
            "Expiry sweeper started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => sweep(&inner),
                _ = shutdown.cancelled() => {
                    tracing::debug!("Shutting down expiry sweeper");
                    break;
                }
            }
        }
    })
}

/// One scan: evict every record older than the maximum age and notify once.
pub(super) fn sweep<C: GenerationClient>(inner: &Inner<C>) {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(inner.config.max_queue_age_ms as i64);

    let expired = {
        let mut store = inner.queue.lock();
        let mut kept = VecDeque::with_capacity(store.records.len());
        let mut expired = Vec::new();
        for record in store.records.drain(..) {
            if record.state.enqueued_at <= cutoff {
                expired.push(record);
            } else {
                kept.push_back(record);
            }
        }
        store.records = kept;
        expired
    };
    if expired.is_empty() {
        return;
    }

    let targets: Vec<TargetId> = expired.into_iter().map(|record| record.expire()).collect();
    inner
        .counters
        .expired
        .fetch_add(targets.len() as u64, Ordering::Relaxed);
    tracing::warn!(count = targets.len(), "Sweep evicted expired requests");

    let hook = inner.on_expired.lock().clone();
    match hook {
        Some(hook) => hook(&targets),
        None => {
            let listed = targets
                .iter()
                .map(|target| target.0.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let fallback = inner.fallback_error.lock().clone();
            fallback(&format!(
                "generation requests expired before submission: {listed}"
            ));
        }
    }
}
