//! Request lifecycle types and state transitions.

mod transitions;
mod types;

pub use types::{
    GenerationInput, Hooks, Queued, Claimed, Polling, QueueState, Request, RequestData, RequestId,
    StatusEvent, TargetId, TaskHandle, ErrorFn, ExpiredFn, UpdateFn,
};
