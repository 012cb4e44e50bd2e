//! State transitions for queued generation requests.
//!
//! Transitions consume the request value and return the next state, so the
//! compiler enforces the lifecycle:
//!
//! ```text
//! Request<Queued> ──claim()──> Request<Claimed> ──into_polling()──> Request<Polling>
//!       │                           │                                     │
//!       │                           ├──release()──> Request<Queued>       ├──succeed()──> (on_update fired)
//!       │                           │   (throttle, back to the front)     └──fail()─────> (on_error fired)
//!       │                           └──fail()─────> (on_error fired)
//!       └──expire()──> TargetId  (collected for the batched sweep notice)
//! ```
//!
//! Terminal transitions (`succeed`, `fail`, `expire`) take `self` by value,
//! which is what guarantees each record's fate reaches its caller exactly
//! once: there is no request left to resolve a second time.

use chrono::Utc;
use metrics::counter;

use super::types::{
    Claimed, ErrorFn, GenerationInput, Hooks, Polling, Queued, Request, RequestData, RequestId,
    StatusEvent, TargetId, TaskHandle,
};
use crate::client::GeneratedClip;

impl Request<Queued> {
    /// Build a fresh record at enqueue time.
    pub(crate) fn enqueue(input: GenerationInput, hooks: Hooks) -> Self {
        Request {
            state: Queued {
                enqueued_at: Utc::now(),
                attempts: 0,
            },
            data: RequestData {
                id: RequestId::generate(),
                target_id: input.target_id,
                source_ref: input.source_ref,
                instruction: input.instruction,
                hooks,
            },
        }
    }

    /// Take the record off the queue head for submission.
    ///
    /// Increments the attempt counter; re-claims after a throttle count too.
    pub(crate) fn claim(self) -> Request<Claimed> {
        let attempts = self.state.attempts + 1;
        tracing::debug!(
            request_id = %self.data.id,
            target_id = %self.data.target_id,
            attempts,
            "Claimed head record for submission"
        );
        Request {
            state: Claimed {
                enqueued_at: self.state.enqueued_at,
                attempts,
                claimed_at: Utc::now(),
            },
            data: self.data,
        }
    }

    /// Evict a record that waited in the queue past the maximum age.
    ///
    /// Returns the target id for the sweeper's batched notification.
    pub(crate) fn expire(self) -> TargetId {
        counter!("floodgate_requests_expired_total").increment(1);
        tracing::warn!(
            request_id = %self.data.id,
            target_id = %self.data.target_id,
            enqueued_at = %self.state.enqueued_at,
            "Evicting expired request from queue"
        );
        self.data.target_id
    }
}

impl Request<Claimed> {
    /// Put the record back at the front of the queue after a throttle.
    ///
    /// The enqueue timestamp is preserved so the expiry clock keeps running
    /// across throttle episodes.
    pub(crate) fn release(self) -> Request<Queued> {
        tracing::debug!(
            request_id = %self.data.id,
            target_id = %self.data.target_id,
            attempts = self.state.attempts,
            "Releasing throttled record back to queue head"
        );
        Request {
            state: Queued {
                enqueued_at: self.state.enqueued_at,
                attempts: self.state.attempts,
            },
            data: self.data,
        }
    }

    /// The remote service accepted the submission and returned a handle.
    pub(crate) fn into_polling(self, task: TaskHandle) -> Request<Polling> {
        counter!("floodgate_requests_submitted_total").increment(1);
        Request {
            state: Polling {
                task,
                attempts: self.state.attempts,
                started_at: Utc::now(),
            },
            data: self.data,
        }
    }

    /// Hard submission failure: report through the error hook and discard.
    pub(crate) fn fail(self, message: &str, fallback: &ErrorFn) {
        counter!("floodgate_requests_failed_total", "stage" => "submit").increment(1);
        report_error(&self.data, message, fallback);
    }
}

impl Request<Polling> {
    /// The remote task finished with a result payload.
    pub(crate) fn succeed(self, clip: GeneratedClip) {
        counter!("floodgate_requests_succeeded_total").increment(1);
        tracing::info!(
            request_id = %self.data.id,
            target_id = %self.data.target_id,
            task = %self.state.task,
            url = %clip.url,
            "Generation succeeded"
        );
        (self.data.hooks.on_update)(StatusEvent::Succeeded {
            task: self.state.task,
            clip,
        });
    }

    /// The remote task failed, timed out, or could not be queried.
    pub(crate) fn fail(self, message: &str, fallback: &ErrorFn) {
        counter!("floodgate_requests_failed_total", "stage" => "poll").increment(1);
        report_error(&self.data, message, fallback);
    }
}

/// Route a terminal failure to the request's own hook, or to the
/// manager-level fallback when the caller supplied none.
fn report_error(data: &RequestData, message: &str, fallback: &ErrorFn) {
    tracing::warn!(
        request_id = %data.id,
        target_id = %data.target_id,
        error = %message,
        "Generation request failed"
    );
    match &data.hooks.on_error {
        Some(hook) => hook(message),
        None => fallback(message),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::request::types::UpdateFn;

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

    #[test]
    fn claim_increments_attempts_and_release_preserves_them() {
        let req = Request::enqueue(input("S1"), Hooks::new(noop_update()));
        let enqueued_at = req.state.enqueued_at;

        let claimed = req.claim();
        assert_eq!(claimed.state.attempts, 1);

        let released = claimed.release();
        assert_eq!(released.state.attempts, 1);
        assert_eq!(released.state.enqueued_at, enqueued_at);

        let reclaimed = released.claim();
        assert_eq!(reclaimed.state.attempts, 2);
    }

    #[test]
    fn fail_prefers_per_request_hook() {
        let own = Arc::new(AtomicUsize::new(0));
        let own_hits = own.clone();
        let fallback_hits = Arc::new(AtomicUsize::new(0));
        let fallback_count = fallback_hits.clone();
        let fallback: ErrorFn = Arc::new(move |_| {
            fallback_count.fetch_add(1, Ordering::SeqCst);
        });

        let hooks = Hooks::with_error(
            noop_update(),
            Arc::new(move |_| {
                own_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let req = Request::enqueue(input("S1"), hooks).claim();
        req.fail("boom", &fallback);

        assert_eq!(own.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fail_uses_fallback_when_no_hook_supplied() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let fallback: ErrorFn = Arc::new(move |msg| {
            sink.lock().push(msg.to_string());
        });

        let req = Request::enqueue(input("S2"), Hooks::new(noop_update())).claim();
        req.fail("generation failed", &fallback);

        assert_eq!(messages.lock().as_slice(), ["generation failed"]);
    }

    #[test]
    fn succeed_delivers_clip_through_update_hook() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hooks = Hooks::new(Arc::new(move |event| {
            sink.lock().push(event);
        }));

        let req = Request::enqueue(input("S3"), hooks)
            .claim()
            .into_polling("task-1".into());
        req.succeed(GeneratedClip {
            url: "https://cdn.example.com/clip.mp4".to_string(),
        });

        let events = events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StatusEvent::Succeeded { task, clip } => {
                assert_eq!(task.0, "task-1");
                assert_eq!(clip.url, "https://cdn.example.com/clip.mp4");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn expire_returns_target_for_batch_notice() {
        let req = Request::enqueue(input("S4"), Hooks::new(noop_update()));
        assert_eq!(req.expire(), TargetId::from("S4"));
    }
}
