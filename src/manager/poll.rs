//! Per-task poll sessions.
//!
//! A session is spawned when the remote service accepts a submission. It
//! queries the task's status immediately, then at a fixed interval, up to
//! the configured attempt ceiling. Whatever the outcome, the session
//! deregisters itself and signals the halt gate, so a halted queue resumes
//! as soon as any in-flight task resolves instead of waiting out the
//! cooldown. The signal is attached to a drop guard: no exit path can skip
//! it.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::client::{GeneratedClip, GenerationClient, TaskStatus};
use crate::error::FloodgateError;
use crate::request::{Polling, Request, TargetId};

/// Bookkeeping for one active poll session.
pub(crate) struct PollInfo {
    pub(crate) target_id: TargetId,
    pub(crate) started_at: DateTime<Utc>,
}

enum Outcome {
    Succeeded(GeneratedClip),
    Failed { message: Option<String> },
    TimedOut,
    Transport(FloodgateError),
    Aborted,
}

/// Spawn a poll session for an accepted submission.
///
/// The session owns the request; terminal outcomes consume it, which is what
/// makes double-resolution unrepresentable even if a timeout and a late
/// success race. Shutdown aborts the session silently, without firing the
/// request's callbacks.
pub(super) fn spawn<C: GenerationClient + 'static>(
    inner: Arc<Inner<C>>,
    request: Request<Polling>,
    shutdown: CancellationToken,
) {
    let task = request.state.task.clone();
    inner.sessions.insert(
        task.clone(),
        PollInfo {
            target_id: request.data.target_id.clone(),
            started_at: request.state.started_at,
        },
    );

    let session = shutdown.child_token();
    tokio::spawn(async move {
        // Completion must reach the halt gate on every exit path.
        let signal_inner = inner.clone();
        let signal_task = task.clone();
        let _completion = scopeguard::guard((), move |_| {
            if let Some((_, info)) = signal_inner.sessions.remove(&signal_task) {
                let elapsed_ms = (Utc::now() - info.started_at).num_milliseconds();
                tracing::debug!(
                    task = %signal_task,
                    target_id = %info.target_id,
                    elapsed_ms,
                    "Poll session finished"
                );
            }
            if signal_inner.halt.resume_if_halted() {
                tracing::info!(
                    task = %signal_task,
                    "In-flight task resolved, resuming halted queue early"
                );
            }
        });

        let interval = Duration::from_millis(inner.config.poll_interval_ms);
        let max_attempts = inner.config.max_poll_attempts;
        let target = request.data.target_id.clone();

        let mut attempt = 0u32;
        let outcome = loop {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = session.cancelled() => break Outcome::Aborted,
                }
            }
            attempt += 1;
            tracing::debug!(
                task = %task,
                target_id = %target,
                attempt,
                max_attempts,
                "Querying task status"
            );

            match inner.client.query_status(&task, &target).await {
                Ok(TaskStatus::Succeeded(clip)) => break Outcome::Succeeded(clip),
                Ok(TaskStatus::Failed { message }) => break Outcome::Failed { message },
                Ok(TaskStatus::Processing) => {
                    if attempt >= max_attempts {
                        break Outcome::TimedOut;
                    }
                }
                Err(err) => break Outcome::Transport(err),
            }
        };

        let fallback = inner.fallback_error.lock().clone();
        match outcome {
            Outcome::Succeeded(clip) => {
                inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                request.succeed(clip);
            }
            Outcome::Failed { message } => {
                if let Some(remote) = message {
                    tracing::debug!(task = %task, remote_message = %remote, "Remote reported task failure");
                }
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                request.fail("generation failed", &fallback);
            }
            Outcome::TimedOut => {
                inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task = %task,
                    attempts = max_attempts,
                    "Task still processing at the attempt ceiling"
                );
                request.fail("generation timed out", &fallback);
            }
            Outcome::Transport(err) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                request.fail(&err.to_string(), &fallback);
            }
            Outcome::Aborted => {
                tracing::debug!(task = %task, "Poll session aborted by shutdown");
            }
        }
    });
}
