//! Remote generation service abstraction.
//!
//! This module defines the `GenerationClient` trait to abstract the two
//! remote calls the queue manager makes (submit a generation job, query a
//! task's status), enabling testability with mock implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::request::{RequestData, TargetId, TaskHandle};

/// Result payload of a finished generation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedClip {
    /// Where the rendered clip can be fetched from.
    pub url: String,
}

/// Status of a remote generation task as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is still rendering. Also reported when the service claims
    /// success but has not yet attached a result payload.
    Processing,
    /// The task finished and the clip is available.
    Succeeded(GeneratedClip),
    /// The task failed on the remote side.
    Failed { message: Option<String> },
}

/// Trait for talking to the remote generation service.
///
/// This abstraction allows different implementations (production vs.
/// testing) and makes the worker and poll loops testable without real
/// network calls. A throttle-class rejection is reported as
/// `Err(FloodgateError::Throttled)` so the worker can halt the queue
/// instead of discarding the record.
#[async_trait]
pub trait GenerationClient: Send + Sync + Clone {
    /// Submit a generation job.
    ///
    /// Returns the task handle assigned by the service on acceptance.
    ///
    /// # Errors
    /// - `FloodgateError::Throttled` when the service signals rate limiting
    /// - `FloodgateError::MissingTaskHandle` when the response carries no id
    /// - transport or protocol errors otherwise
    async fn submit(&self, request: &RequestData, timeout_ms: u64) -> Result<TaskHandle>;

    /// Query the status of a previously submitted task.
    async fn query_status(&self, task: &TaskHandle, target_id: &TargetId) -> Result<TaskStatus>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Marker phrase the service uses for capacity rejections that arrive with a
/// non-429 status.
const THROTTLE_MARKER: &str = "parallel task over resource pack limit";

const DEFAULT_SUBMIT_PATH: &str = "/v1/videos/image2video";

/// Production client speaking the service's JSON shape over HTTP.
#[derive(Clone)]
pub struct HttpGenerationClient {
    client: reqwest::Client,
    endpoint: String,
    submit_path: String,
    api_key: String,
}

impl HttpGenerationClient {
    /// Create a client for the given base endpoint.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            submit_path: DEFAULT_SUBMIT_PATH.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Override the submission path (status queries append the task id).
    pub fn with_submit_path(mut self, path: impl Into<String>) -> Self {
        self.submit_path = path.into();
        self
    }

    /// Sources may arrive as data URLs from a canvas or file reader; the
    /// service wants the bare base64 payload.
    fn strip_data_url(source_ref: &str) -> &str {
        if source_ref.starts_with("data:image/") {
            match source_ref.split_once(";base64,") {
                Some((_, payload)) => payload,
                None => source_ref,
            }
        } else {
            source_ref
        }
    }
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    image: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct SubmitEnvelope {
    data: Option<SubmitData>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct SubmitData {
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    data: Option<StatusData>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct StatusData {
    task_status: Option<String>,
    task_status_msg: Option<String>,
    task_result: Option<TaskResultData>,
}

#[derive(Deserialize)]
struct TaskResultData {
    #[serde(default)]
    videos: Vec<VideoData>,
}

#[derive(Deserialize)]
struct VideoData {
    url: Option<String>,
    resource: Option<String>,
}

fn parse_submit_response(status: u16, body: &str) -> Result<TaskHandle> {
    let envelope: SubmitEnvelope = serde_json::from_str(body)?;
    let message = envelope.message.unwrap_or_else(|| "Unknown error".to_string());

    if status == 429 || message.contains(THROTTLE_MARKER) {
        return Err(FloodgateError::Throttled(message));
    }
    if !(200..300).contains(&status) {
        return Err(anyhow::anyhow!("generation API error: {}", message).into());
    }

    envelope
        .data
        .and_then(|d| d.task_id)
        .map(TaskHandle)
        .ok_or(FloodgateError::MissingTaskHandle)
}

fn parse_status_response(status: u16, body: &str) -> Result<TaskStatus> {
    let envelope: StatusEnvelope = serde_json::from_str(body)?;

    if !(200..300).contains(&status) {
        let message = envelope.message.unwrap_or_else(|| "Unknown error".to_string());
        return Err(anyhow::anyhow!("status query failed: {}", message).into());
    }

    let Some(data) = envelope.data else {
        return Ok(TaskStatus::Processing);
    };

    match data.task_status.as_deref() {
        Some("succeed") => {
            let clip = data
                .task_result
                .and_then(|r| r.videos.into_iter().next())
                .and_then(|v| v.url.or(v.resource));
            match clip {
                Some(url) => Ok(TaskStatus::Succeeded(GeneratedClip { url })),
                // Succeeded without a payload yet: keep polling.
                None => Ok(TaskStatus::Processing),
            }
        }
        Some("failed") => Ok(TaskStatus::Failed {
            message: data.task_status_msg,
        }),
        _ => Ok(TaskStatus::Processing),
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, target_id = %request.target_id))]
    async fn submit(&self, request: &RequestData, timeout_ms: u64) -> Result<TaskHandle> {
        let url = format!("{}{}", self.endpoint, self.submit_path);
        let body = SubmitBody {
            image: Self::strip_data_url(&request.source_ref),
            prompt: &request.instruction,
        };

        tracing::debug!(url = %url, timeout_ms, "Submitting generation request");

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(timeout_ms))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let handle = parse_submit_response(status, &text)?;

        tracing::info!(task = %handle, "Generation request accepted");
        Ok(handle)
    }

    async fn query_status(&self, task: &TaskHandle, target_id: &TargetId) -> Result<TaskStatus> {
        let url = format!("{}{}/{}", self.endpoint, self.submit_path, task);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let report = parse_status_response(status, &text)?;

        tracing::debug!(task = %task, target_id = %target_id, status = ?report, "Task status");
        Ok(report)
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Mock generation client for testing.
///
/// Submit outcomes are scripted in FIFO order; status outcomes are scripted
/// per task handle, with `Processing` returned once a task's script runs
/// dry. Submissions are recorded in call order so tests can assert the
/// queue's FIFO guarantee.
#[derive(Clone)]
pub struct MockGenerationClient {
    submits: Arc<Mutex<VecDeque<MockSubmit>>>,
    statuses: Arc<Mutex<HashMap<TaskHandle, VecDeque<Result<TaskStatus>>>>>,
    submitted: Arc<Mutex<Vec<TargetId>>>,
    status_calls: Arc<Mutex<HashMap<TaskHandle, usize>>>,
}

enum MockSubmit {
    /// Immediate outcome.
    Immediate(Result<TaskHandle>),
    /// Outcome that waits for a trigger signal before completing.
    Triggered {
        result: Result<TaskHandle>,
        trigger: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    },
}

impl MockGenerationClient {
    pub fn new() -> Self {
        Self {
            submits: Arc::new(Mutex::new(VecDeque::new())),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            submitted: Arc::new(Mutex::new(Vec::new())),
            status_calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Script the outcome of the next unscripted submission.
    pub fn push_submit(&self, result: Result<TaskHandle>) {
        self.submits.lock().push_back(MockSubmit::Immediate(result));
    }

    /// Script a submission outcome that blocks until triggered.
    ///
    /// Returns a sender that, when triggered (by sending `()` or dropping),
    /// lets the submission complete with the given result.
    pub fn push_submit_with_trigger(&self, result: Result<TaskHandle>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.submits.lock().push_back(MockSubmit::Triggered {
            result,
            trigger: Arc::new(Mutex::new(Some(rx))),
        });
        tx
    }

    /// Script the next status outcome for a task.
    pub fn push_status(&self, task: impl Into<TaskHandle>, result: Result<TaskStatus>) {
        self.statuses
            .lock()
            .entry(task.into())
            .or_default()
            .push_back(result);
    }

    /// Targets submitted so far, in submission order.
    pub fn submitted_targets(&self) -> Vec<TargetId> {
        self.submitted.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Number of status queries made for a task.
    pub fn status_call_count(&self, task: &TaskHandle) -> usize {
        self.status_calls.lock().get(task).copied().unwrap_or(0)
    }
}

impl Default for MockGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn submit(&self, request: &RequestData, _timeout_ms: u64) -> Result<TaskHandle> {
        self.submitted.lock().push(request.target_id.clone());

        let scripted = self.submits.lock().pop_front();
        match scripted {
            Some(MockSubmit::Immediate(result)) => result,
            Some(MockSubmit::Triggered { result, trigger }) => {
                let rx = trigger.lock().take();
                if let Some(rx) = rx {
                    // Wait for the trigger (proceed either way on drop).
                    let _ = rx.await;
                }
                result
            }
            None => Err(anyhow::anyhow!(
                "no scripted submit response for target {}",
                request.target_id
            )
            .into()),
        }
    }

    async fn query_status(&self, task: &TaskHandle, _target_id: &TargetId) -> Result<TaskStatus> {
        *self.status_calls.lock().entry(task.clone()).or_insert(0) += 1;

        let scripted = self
            .statuses
            .lock()
            .get_mut(task)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(result) => result,
            // Script ran dry: the task is still rendering.
            None => Ok(TaskStatus::Processing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{GenerationInput, Hooks, Request};

    fn request_data(target: &str) -> RequestData {
        Request::enqueue(
            GenerationInput {
                target_id: target.into(),
                source_ref: "data:image/png;base64,aGVsbG8=".to_string(),
                instruction: "orbit left".to_string(),
            },
            Hooks::new(Arc::new(|_| {})),
        )
        .data
    }

    #[test]
    fn strips_data_url_prefix() {
        assert_eq!(
            HttpGenerationClient::strip_data_url("data:image/png;base64,aGVsbG8="),
            "aGVsbG8="
        );
        assert_eq!(HttpGenerationClient::strip_data_url("aGVsbG8="), "aGVsbG8=");
    }

    #[test]
    fn submit_parse_maps_throttle_and_success() {
        let ok = parse_submit_response(200, r#"{"data":{"task_id":"t-1"}}"#).unwrap();
        assert_eq!(ok, TaskHandle::from("t-1"));

        let throttled = parse_submit_response(429, r#"{"message":"too many requests"}"#);
        assert!(matches!(throttled, Err(FloodgateError::Throttled(_))));

        // Capacity rejections can arrive with a 200-range status and only the
        // marker phrase in the message.
        let marker = parse_submit_response(
            400,
            r#"{"message":"parallel task over resource pack limit"}"#,
        );
        assert!(matches!(marker, Err(FloodgateError::Throttled(_))));

        let missing = parse_submit_response(200, r#"{"data":{}}"#);
        assert!(matches!(missing, Err(FloodgateError::MissingTaskHandle)));
    }

    #[test]
    fn status_parse_requires_payload_for_success() {
        let done = parse_status_response(
            200,
            r#"{"data":{"task_status":"succeed","task_result":{"videos":[{"url":"https://cdn/clip.mp4"}]}}}"#,
        )
        .unwrap();
        assert_eq!(
            done,
            TaskStatus::Succeeded(GeneratedClip {
                url: "https://cdn/clip.mp4".to_string()
            })
        );

        // Falls back to the resource field when url is absent.
        let resource = parse_status_response(
            200,
            r#"{"data":{"task_status":"succeed","task_result":{"videos":[{"resource":"https://cdn/alt.mp4"}]}}}"#,
        )
        .unwrap();
        assert_eq!(
            resource,
            TaskStatus::Succeeded(GeneratedClip {
                url: "https://cdn/alt.mp4".to_string()
            })
        );

        let no_payload =
            parse_status_response(200, r#"{"data":{"task_status":"succeed"}}"#).unwrap();
        assert_eq!(no_payload, TaskStatus::Processing);

        let failed = parse_status_response(
            200,
            r#"{"data":{"task_status":"failed","task_status_msg":"nsfw"}}"#,
        )
        .unwrap();
        assert_eq!(
            failed,
            TaskStatus::Failed {
                message: Some("nsfw".to_string())
            }
        );

        let rendering = parse_status_response(200, r#"{"data":{"task_status":"processing"}}"#).unwrap();
        assert_eq!(rendering, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn mock_scripts_submits_in_fifo_order() {
        let mock = MockGenerationClient::new();
        mock.push_submit(Ok("t-1".into()));
        mock.push_submit(Err(FloodgateError::Throttled("limit".into())));

        let first = mock.submit(&request_data("S1"), 5000).await.unwrap();
        assert_eq!(first, TaskHandle::from("t-1"));

        let second = mock.submit(&request_data("S2"), 5000).await;
        assert!(matches!(second, Err(FloodgateError::Throttled(_))));

        // Unscripted submits fail loudly.
        let third = mock.submit(&request_data("S3"), 5000).await;
        assert!(third.is_err());

        assert_eq!(
            mock.submitted_targets(),
            vec![
                TargetId::from("S1"),
                TargetId::from("S2"),
                TargetId::from("S3")
            ]
        );
    }

    #[tokio::test]
    async fn mock_status_script_runs_dry_to_processing() {
        let mock = MockGenerationClient::new();
        mock.push_status(
            "t-1",
            Ok(TaskStatus::Succeeded(GeneratedClip {
                url: "https://cdn/clip.mp4".to_string(),
            })),
        );

        let task = TaskHandle::from("t-1");
        let target = TargetId::from("S1");
        let first = mock.query_status(&task, &target).await.unwrap();
        assert!(matches!(first, TaskStatus::Succeeded(_)));

        let second = mock.query_status(&task, &target).await.unwrap();
        assert_eq!(second, TaskStatus::Processing);
        assert_eq!(mock.status_call_count(&task), 2);
    }

    #[tokio::test]
    async fn mock_triggered_submit_blocks_until_released() {
        let mock = MockGenerationClient::new();
        let trigger = mock.push_submit_with_trigger(Ok("t-9".into()));

        let mock_clone = mock.clone();
        let handle =
            tokio::spawn(async move { mock_clone.submit(&request_data("S1"), 5000).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        trigger.send(()).unwrap();
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, TaskHandle::from("t-9"));
    }
}
