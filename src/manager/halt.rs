//! Halt/resume gate for the submission worker.
//!
//! A throttle response halts the queue for a cooldown. The gate is released
//! either by the cooldown timer or early, when any in-flight poll session
//! resolves. Both paths go through `resume_if_halted`, which is idempotent.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct HaltState {
    halted: bool,
    resume_timer: Option<CancellationToken>,
}

/// Cheaply clonable; clones share the same gate.
#[derive(Clone)]
pub(crate) struct HaltController {
    state: Arc<Mutex<HaltState>>,
    wake: Arc<Notify>,
}

impl HaltController {
    pub(crate) fn new(wake: Arc<Notify>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HaltState::default())),
            wake,
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    /// Halt the queue and arm the resume timer.
    ///
    /// Armed only on the not-halted -> halted transition: repeated throttle
    /// signals during an episode leave the running cooldown untouched.
    pub(crate) fn engage(&self, cooldown: Duration, shutdown: CancellationToken) {
        let timer = {
            let mut state = self.state.lock();
            if state.halted {
                tracing::debug!("Queue already halted, keeping existing resume timer");
                return;
            }
            state.halted = true;
            let timer = CancellationToken::new();
            state.resume_timer = Some(timer.clone());
            timer
        };

        counter!("floodgate_queue_halts_total").increment(1);
        tracing::warn!(
            cooldown_ms = cooldown.as_millis() as u64,
            "Throttle detected, halting queue"
        );

        let controller = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {
                    tracing::info!("Resume cooldown elapsed, resuming queue");
                    controller.resume_if_halted();
                }
                _ = timer.cancelled() => {
                    tracing::debug!("Resume timer cancelled, queue already resumed");
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Release the gate and wake the worker. No-op when not halted.
    ///
    /// Returns whether this call performed the resume.
    pub(crate) fn resume_if_halted(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.halted {
                return false;
            }
            state.halted = false;
            if let Some(timer) = state.resume_timer.take() {
                timer.cancel();
            }
        }
        self.wake.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_is_idempotent() {
        let wake = Arc::new(Notify::new());
        let halt = HaltController::new(wake);
        let shutdown = CancellationToken::new();

        assert!(!halt.is_halted());
        halt.engage(Duration::from_secs(30), shutdown);
        assert!(halt.is_halted());

        assert!(halt.resume_if_halted());
        assert!(!halt.resume_if_halted());
        assert!(!halt.is_halted());
    }

    #[tokio::test]
    async fn cooldown_timer_resumes_and_wakes_worker() {
        let wake = Arc::new(Notify::new());
        let halt = HaltController::new(wake.clone());
        let shutdown = CancellationToken::new();

        halt.engage(Duration::from_millis(20), shutdown);
        assert!(halt.is_halted());

        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .expect("worker was not woken by the resume timer");
        assert!(!halt.is_halted());
    }

    #[tokio::test]
    async fn repeated_throttle_does_not_rearm_timer() {
        let wake = Arc::new(Notify::new());
        let halt = HaltController::new(wake.clone());
        let shutdown = CancellationToken::new();

        halt.engage(Duration::from_millis(30), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        // Second throttle mid-episode: the original 30ms cooldown still
        // governs, so the resume lands ~15ms from now, not 30ms.
        halt.engage(Duration::from_millis(30), shutdown);

        tokio::time::timeout(Duration::from_millis(25), wake.notified())
            .await
            .expect("resume should follow the first timer, not the second");
        assert!(!halt.is_halted());
    }
}
