use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::dispatch::StylistProfile;
use crate::error::RunwayError;
use crate::pipeline::VideoOutcome;

/// Success body for the video endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResponse {
    pub video_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub attempts: u32,
}

impl VideoResponse {
    pub fn with_prompt(outcome: VideoOutcome) -> Self {
        Self {
            video_url: outcome.url,
            prompt: Some(outcome.prompt),
            attempts: outcome.attempts,
        }
    }

    pub fn without_prompt(outcome: VideoOutcome) -> Self {
        Self {
            video_url: outcome.url,
            prompt: None,
            attempts: outcome.attempts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StylistInfo {
    pub id: String,
    pub name: String,
    pub icon: String,
}

impl From<StylistProfile> for StylistInfo {
    fn from(profile: StylistProfile) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            icon: profile.icon,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StylistListResponse {
    pub stylists: Vec<StylistInfo>,
}

/// Error body: redacted message plus the stable failure kind.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

/// Request-level error rendered as `{error, kind}` with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Failed(RunwayError),
}

impl From<RunwayError> for ApiError {
    fn from(e: RunwayError) -> Self {
        Self::Failed(e)
    }
}

pub fn status_for(e: &RunwayError) -> StatusCode {
    match e {
        RunwayError::JobTimedOut { .. } | RunwayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RunwayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RunwayError::PromptGeneration { .. }
        | RunwayError::JobFailed { .. }
        | RunwayError::JobExpired { .. }
        | RunwayError::MissingJobId
        | RunwayError::PollFailed { .. }
        | RunwayError::Upstream { .. }
        | RunwayError::AuthFailed { .. }
        | RunwayError::EmptyResponse { .. }
        | RunwayError::ContentRejected { .. }
        | RunwayError::SchemaParse(_)
        | RunwayError::Request(_) => StatusCode::BAD_GATEWAY,
        RunwayError::Cancelled | RunwayError::Config(_) | RunwayError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    kind: "bad_request",
                },
            ),
            Self::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: message,
                    kind: "unavailable",
                },
            ),
            Self::Failed(e) => {
                tracing::warn!(reason = e.reason(), "request failed: {e}");
                (
                    status_for(&e),
                    ErrorBody {
                        error: e.user_message(),
                        kind: e.reason(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
