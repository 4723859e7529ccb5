use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunwayError {
    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("{provider} rejected the content: {message}")]
    ContentRejected { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("animation prompt generation failed: {message}")]
    PromptGeneration { message: String },

    #[error("video job failed: {cause}")]
    JobFailed { cause: String },

    #[error("video job expired: {cause}")]
    JobExpired { cause: String },

    #[error("video job timed out after {attempts} status queries")]
    JobTimedOut { attempts: u32 },

    #[error("missing job identifier")]
    MissingJobId,

    #[error("poll failed for job {job_id}: {message}")]
    PollFailed { job_id: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RunwayError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::EmptyResponse { provider } => Some(provider),
            Self::ContentRejected { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Stable snake_case tag for the failure kind. Video callers key retry
    /// decisions off this, so `job_timed_out` and `job_failed` stay distinct.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Upstream { .. } => "upstream",
            Self::EmptyResponse { .. } => "empty_response",
            Self::ContentRejected { .. } => "content_rejected",
            Self::SchemaParse(_) => "parse_error",
            Self::Request(_) => "request_failed",
            Self::PromptGeneration { .. } => "prompt_generation",
            Self::JobFailed { .. } => "job_failed",
            Self::JobExpired { .. } => "job_expired",
            Self::JobTimedOut { .. } => "job_timed_out",
            Self::MissingJobId => "missing_job_id",
            Self::PollFailed { .. } => "poll_failed",
            Self::Config(_) => "config",
            Self::Other(_) => "error",
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    /// Nothing in the crate retries automatically; this is for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Upstream { status, .. } => {
                // 5xx = server error (retryable), 4xx = client error (not retryable)
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) => true,
            Self::PollFailed { .. } => true,
            Self::JobTimedOut { .. } => true,
            _ => false,
        }
    }

    /// Produce a sanitized error message safe for returning to clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled => "request cancelled".to_string(),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("{provider} returned HTTP {code}"),
                None => format!("upstream error from {provider}"),
            },
            Self::EmptyResponse { provider } => format!("{provider} returned an empty response"),
            Self::ContentRejected { provider, .. } => {
                format!("{provider} declined to respond to this image")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::PromptGeneration { .. } => "failed to generate animation prompt".to_string(),
            Self::JobFailed { .. } => "video generation failed".to_string(),
            Self::JobExpired { .. } => "video generation expired".to_string(),
            Self::JobTimedOut { attempts } => {
                format!("video generation timed out after {attempts} status checks")
            }
            Self::MissingJobId => "video provider returned no job identifier".to_string(),
            Self::PollFailed { .. } => "failed to check video status".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}
