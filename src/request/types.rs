//! Core types for the generation queue.
//!
//! This module defines the type-safe request lifecycle using the typestate
//! pattern. Each queued generation request progresses through distinct
//! states, enforced at compile time: a record is `Queued` while it waits in
//! the store, `Claimed` while the worker submits it, and `Polling` once the
//! remote service has accepted it and a poll session tracks the task.
//! Terminal outcomes consume the value, so a record cannot be resolved twice.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::GeneratedClip;

/// Callback invoked with lifecycle status events for one request.
pub type UpdateFn = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Callback invoked with a terminal failure message for one request.
pub type ErrorFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Manager-level callback invoked with the targets evicted in one sweep.
pub type ExpiredFn = Arc<dyn Fn(&[TargetId]) + Send + Sync>;

/// Marker trait for valid request states.
pub trait QueueState: Send + Sync {}

/// A generation request tracked by the queue manager.
///
/// Uses the typestate pattern to ensure type-safe state transitions. The
/// generic parameter `T` represents the current state of the request.
#[derive(Debug, Clone)]
pub struct Request<T: QueueState> {
    /// The current state of the request.
    pub state: T,
    /// The caller-supplied request data.
    pub data: RequestData,
}

/// Caller-supplied data for one generation request.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// Internal id, used for logging and metrics only.
    pub id: RequestId,

    /// Opaque identifier of the thing being generated for (e.g. a scene).
    pub target_id: TargetId,

    /// Reference to the source image. May be a raw base64 payload or a
    /// `data:image/...;base64,` URL; the HTTP client strips the prefix.
    pub source_ref: String,

    /// Instruction text describing the motion to generate.
    pub instruction: String,

    /// Lifecycle callbacks for this request.
    pub hooks: Hooks,
}

/// Per-request lifecycle callbacks.
///
/// `on_error` is optional; requests enqueued without one report terminal
/// failures through the manager-level fallback handler instead.
#[derive(Clone)]
pub struct Hooks {
    pub on_update: UpdateFn,
    pub on_error: Option<ErrorFn>,
}

impl Hooks {
    pub fn new(on_update: UpdateFn) -> Self {
        Self {
            on_update,
            on_error: None,
        }
    }

    pub fn with_error(on_update: UpdateFn, on_error: ErrorFn) -> Self {
        Self {
            on_update,
            on_error: Some(on_error),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Input for enqueueing one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInput {
    pub target_id: TargetId,
    pub source_ref: String,
    pub instruction: String,
}

/// Lifecycle status event delivered through a request's `on_update` hook.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    /// The request was appended to the queue store.
    Queued,
    /// The remote task finished and produced a clip.
    Succeeded {
        task: TaskHandle,
        clip: GeneratedClip,
    },
}

// ============================================================================
// Request States
// ============================================================================

/// Request is waiting in the queue store.
///
/// This is the initial state for all newly enqueued requests.
#[derive(Debug, Clone)]
pub struct Queued {
    /// When the request was enqueued. The expiry sweeper evicts records
    /// whose age exceeds the configured maximum.
    pub enqueued_at: DateTime<Utc>,
    /// Number of submission attempts so far (0 = never claimed).
    pub attempts: u32,
}

impl QueueState for Queued {}

/// Request has been taken off the queue head and is being submitted.
///
/// A claimed record is not in the sweepable store, so the expiry sweeper
/// can never evict a record mid-submission.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
}

impl QueueState for Claimed {}

/// The remote service accepted the submission; a poll session tracks it.
#[derive(Debug, Clone)]
pub struct Polling {
    pub task: TaskHandle,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
}

impl QueueState for Polling {}

// ============================================================================
// Identifiers
// ============================================================================

/// Internal identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub(crate) fn generate() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

/// Opaque caller-supplied identifier for the generation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        TargetId(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        TargetId(s)
    }
}

/// Handle assigned by the remote service to an accepted generation task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskHandle {
    fn from(s: &str) -> Self {
        TaskHandle(s.to_string())
    }
}

impl From<String> for TaskHandle {
    fn from(s: String) -> Self {
        TaskHandle(s)
    }
}
