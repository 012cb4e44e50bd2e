//! Throttle-aware FIFO queue manager for remote video generation requests.
//!
//! This crate coordinates generation jobs against a rate-limited remote
//! service. A single worker submits the head of a FIFO queue; accepted
//! submissions hand off to independent poll sessions that track the remote
//! task to completion. A throttle response halts the queue for a cooldown,
//! keeping the head record for retry, and any in-flight task resolving
//! resumes the queue early. A background sweeper evicts requests that waited
//! in the queue past a maximum age and reports them in one batched
//! notification.
//!
//! ```no_run
//! use std::sync::Arc;
//! use floodgate::{GenerationInput, Hooks, HttpGenerationClient, QueueManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let client = HttpGenerationClient::new("https://api.example.com", "api-key");
//! let manager = QueueManager::new(client);
//!
//! let shutdown = CancellationToken::new();
//! let worker = manager.run(shutdown.clone());
//!
//! manager.enqueue(
//!     GenerationInput {
//!         target_id: "scene-1".into(),
//!         source_ref: "aGVsbG8=".to_string(),
//!         instruction: "slow pan across the skyline".to_string(),
//!     },
//!     Hooks::new(Arc::new(|event| println!("{event:?}"))),
//! );
//!
//! shutdown.cancel();
//! let _ = worker.await;
//! # }
//! ```

pub mod client;
pub mod error;
pub mod manager;
pub mod request;

// Re-export commonly used types
pub use client::{
    GeneratedClip, GenerationClient, HttpGenerationClient, MockGenerationClient, TaskStatus,
};
pub use error::{FloodgateError, Result};
pub use manager::{ManagerConfig, ManagerStats, QueueManager};
pub use request::{
    ErrorFn, ExpiredFn, GenerationInput, Hooks, StatusEvent, TargetId, TaskHandle, UpdateFn,
};
