use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::VideoConfig;
use crate::error::RunwayError;

/// Max response body size for submit and status responses.
const MAX_VIDEO_RESPONSE_BYTES: usize = 1024 * 1024;

/// Consecutive status-call transport failures tolerated before giving up.
pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;

/// Body of a video creation call.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitRequest {
    pub model: String,
    pub prompt: String,
    /// Public URL or data URL, depending on what the provider accepts.
    pub image_url: String,
    pub duration: u32,
}

/// What the creation call told us.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Provider finished synchronously.
    Ready(String),
    /// Provider accepted the job; poll this id.
    Pending(String),
}

/// What one status query told us.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus {
    InProgress,
    Succeeded(String),
    Failed(String),
    Expired(String),
}

fn video_url(body: &Value) -> Option<&str> {
    body["video"]["url"].as_str().filter(|u| !u.is_empty())
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classify a creation response: synchronous URL first, then an error field,
/// then the job id.
pub fn classify_submit(body: &Value) -> Result<SubmitOutcome, RunwayError> {
    if let Some(url) = video_url(body) {
        return Ok(SubmitOutcome::Ready(url.to_string()));
    }
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(RunwayError::JobFailed {
            cause: error_message(error),
        });
    }
    body["request_id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .map(|id| SubmitOutcome::Pending(id.to_string()))
        .ok_or(RunwayError::MissingJobId)
}

/// Classify a status response. A URL (or `done` with a URL) wins, then
/// explicit failure or expiry. `done` without a URL keeps polling.
pub fn classify_status(body: &Value) -> PollStatus {
    if let Some(url) = video_url(body) {
        return PollStatus::Succeeded(url.to_string());
    }
    let status = body["status"].as_str();
    if status == Some("expired") {
        return PollStatus::Expired(body.to_string());
    }
    if status == Some("failed") || body.get("error").is_some_and(|e| !e.is_null()) {
        return PollStatus::Failed(body.to_string());
    }
    if status == Some("done") {
        tracing::warn!("video job reported done without a url, continuing to poll");
    }
    PollStatus::InProgress
}

/// Transport for a long-running video provider.
#[async_trait]
pub trait VideoApi: Send + Sync {
    /// Issue the creation call and return the raw JSON body.
    async fn submit(&self, req: &SubmitRequest) -> Result<Value, RunwayError>;

    /// Query job status and return the raw JSON body.
    async fn status(&self, job_id: &str) -> Result<Value, RunwayError>;
}

// ---------------------------------------------------------------------------
// xAI video generations API
// ---------------------------------------------------------------------------

pub struct XaiVideoApi {
    client: Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl XaiVideoApi {
    pub fn new(client: Client, base_url: &str, api_key: &str, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            request_timeout,
        }
    }

    pub fn from_config(client: Client, config: &VideoConfig) -> Self {
        Self::new(
            client,
            &config.base_url,
            &config.api_key,
            config.request_timeout,
        )
    }

    pub fn submit_url(&self) -> String {
        format!("{}/videos/generations", self.base_url)
    }

    pub fn status_url(&self, job_id: &str) -> String {
        format!("{}/videos/{job_id}", self.base_url)
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, RunwayError> {
        if let Some(len) = response.content_length()
            && len as usize > MAX_VIDEO_RESPONSE_BYTES
        {
            return Err(RunwayError::Upstream {
                provider: "xai".to_string(),
                message: format!("video response too large: {len} bytes"),
                status: None,
            });
        }
        let bytes = response.bytes().await.map_err(RunwayError::Request)?;
        if bytes.len() > MAX_VIDEO_RESPONSE_BYTES {
            return Err(RunwayError::Upstream {
                provider: "xai".to_string(),
                message: format!("video response too large: {} bytes", bytes.len()),
                status: None,
            });
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| RunwayError::SchemaParse(format!("video response: {e}")))
    }

    fn map_send_error(e: reqwest::Error, start: Instant) -> RunwayError {
        if e.is_timeout() {
            RunwayError::Timeout(start.elapsed().as_millis() as u64)
        } else {
            RunwayError::Request(e)
        }
    }
}

#[async_trait]
impl VideoApi for XaiVideoApi {
    async fn submit(&self, req: &SubmitRequest) -> Result<Value, RunwayError> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.submit_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.request_timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, start))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RunwayError::AuthFailed {
                provider: "xai".to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RunwayError::RateLimited {
                provider: "xai".to_string(),
            });
        }
        if !status.is_success() {
            // A JSON error payload is the provider's own verdict on the job;
            // pass it through so it is reported as a job failure.
            return match Self::read_json(response).await {
                Ok(body) if body.get("error").is_some_and(|e| !e.is_null()) => Ok(body),
                _ => Err(RunwayError::Upstream {
                    provider: "xai".to_string(),
                    message: format!("video submit failed with HTTP {status}"),
                    status: Some(status.as_u16()),
                }),
            };
        }
        Self::read_json(response).await
    }

    async fn status(&self, job_id: &str) -> Result<Value, RunwayError> {
        let start = Instant::now();
        let response = self
            .client
            .get(self.status_url(job_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, start))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RunwayError::AuthFailed {
                provider: "xai".to_string(),
                message: format!("poll HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(RunwayError::Upstream {
                provider: "xai".to_string(),
                message: format!("poll returned HTTP {status}"),
                status: Some(status.as_u16()),
            });
        }
        Self::read_json(response).await
    }
}

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    Expired,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Expired | Self::TimedOut
        )
    }
}

/// State of one submission. Owned by a single `JobPoller::run` call and
/// dropped when it returns.
#[derive(Debug)]
pub struct VideoJob {
    remote_job_id: Option<String>,
    attempts_used: u32,
    state: JobState,
    result_url: Option<String>,
}

impl VideoJob {
    fn new() -> Self {
        Self {
            remote_job_id: None,
            attempts_used: 0,
            state: JobState::Submitted,
            result_url: None,
        }
    }

    pub fn remote_job_id(&self) -> Option<&str> {
        self.remote_job_id.as_deref()
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    /// Terminal states are sticky.
    fn transition(&mut self, next: JobState) {
        if self.state.is_terminal() {
            tracing::error!(from = ?self.state, to = ?next, "ignored transition out of terminal state");
            return;
        }
        tracing::debug!(job_id = ?self.remote_job_id, from = ?self.state, to = ?next, "job transition");
        self.state = next;
    }
}

/// Poll timing. `interval * max_attempts` is the effective deadline.
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 90,
        }
    }
}

impl From<&VideoConfig> for PollSettings {
    fn from(config: &VideoConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Successful terminal report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub url: String,
    pub remote_job_id: Option<String>,
    pub attempts: u32,
}

/// Drives one remote job from submission to a terminal state.
pub struct JobPoller {
    api: Arc<dyn VideoApi>,
    settings: PollSettings,
}

impl JobPoller {
    pub fn new(api: Arc<dyn VideoApi>, settings: PollSettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Submit and poll until success, failure, expiry, timeout or cancellation.
    pub async fn run(
        &self,
        req: &SubmitRequest,
        cancel: &CancellationToken,
    ) -> Result<JobReport, RunwayError> {
        let start = Instant::now();
        let mut job = VideoJob::new();

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunwayError::Cancelled),
            body = self.api.submit(req) => body?,
        };

        let job_id = match classify_submit(&submitted) {
            Ok(SubmitOutcome::Ready(url)) => {
                job.result_url = Some(url.clone());
                job.transition(JobState::Succeeded);
                tracing::info!("video returned synchronously");
                return Ok(JobReport {
                    url,
                    remote_job_id: None,
                    attempts: 0,
                });
            }
            Ok(SubmitOutcome::Pending(id)) => id,
            Err(e) => {
                job.transition(JobState::Failed);
                tracing::warn!("video submit rejected: {e}");
                return Err(e);
            }
        };

        job.remote_job_id = Some(job_id.clone());
        job.transition(JobState::Polling);
        tracing::info!(job_id = %job_id, "video job submitted");

        let mut consecutive_failures: u32 = 0;

        loop {
            // Budget is checked before every query, so a zero budget issues none.
            if job.attempts_used >= self.settings.max_attempts {
                job.transition(JobState::TimedOut);
                tracing::warn!(
                    job_id = %job_id,
                    attempts = job.attempts_used,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "video job timed out"
                );
                return Err(RunwayError::JobTimedOut {
                    attempts: job.attempts_used,
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_id = %job_id, attempts = job.attempts_used, "video polling cancelled");
                    return Err(RunwayError::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            job.attempts_used += 1;
            let attempt = job.attempts_used;

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunwayError::Cancelled),
                body = self.api.status(&job_id) => body,
            };

            match polled {
                Ok(body) => {
                    consecutive_failures = 0;
                    match classify_status(&body) {
                        PollStatus::Succeeded(url) => {
                            job.result_url = Some(url.clone());
                            job.transition(JobState::Succeeded);
                            tracing::info!(
                                job_id = %job_id,
                                attempts = attempt,
                                elapsed_ms = start.elapsed().as_millis() as u64,
                                "video job completed"
                            );
                            return Ok(JobReport {
                                url,
                                remote_job_id: Some(job_id),
                                attempts: attempt,
                            });
                        }
                        PollStatus::Expired(cause) => {
                            job.transition(JobState::Expired);
                            tracing::warn!(job_id = %job_id, attempts = attempt, "video job expired");
                            return Err(RunwayError::JobExpired { cause });
                        }
                        PollStatus::Failed(cause) => {
                            job.transition(JobState::Failed);
                            tracing::warn!(job_id = %job_id, attempts = attempt, "video job failed");
                            return Err(RunwayError::JobFailed { cause });
                        }
                        PollStatus::InProgress => {
                            tracing::debug!(job_id = %job_id, attempt = attempt, "video job in progress");
                        }
                    }
                }
                Err(e @ RunwayError::AuthFailed { .. }) => {
                    job.transition(JobState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempt,
                        failures = consecutive_failures,
                        "status query failed: {e}"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        job.transition(JobState::Failed);
                        return Err(RunwayError::PollFailed {
                            job_id,
                            message: format!("{consecutive_failures} consecutive failures: {e}"),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_state_is_sticky() {
        let mut job = VideoJob::new();
        job.transition(JobState::Polling);
        job.transition(JobState::Expired);
        job.transition(JobState::Polling);
        assert_eq!(job.state(), JobState::Expired);
    }

    #[test]
    fn url_beats_failed_status() {
        let body = json!({"status": "failed", "video": {"url": "https://v/x.mp4"}});
        assert_eq!(
            classify_status(&body),
            PollStatus::Succeeded("https://v/x.mp4".into())
        );
    }

    #[test]
    fn done_without_url_keeps_polling() {
        assert_eq!(classify_status(&json!({"status": "done"})), PollStatus::InProgress);
    }

    #[test]
    fn null_error_is_not_an_error() {
        let body = json!({"request_id": "r1", "error": null});
        assert_eq!(
            classify_submit(&body).unwrap(),
            SubmitOutcome::Pending("r1".into())
        );
    }
}
