use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{Config, OrchestratorConfig};
use crate::dispatch::ImageInput;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::registry::Registry;
use crate::events::{self, ProgressEvent};
use crate::orchestrator::Orchestrator;
use crate::pipeline::VideoPipeline;
use crate::response::{ApiError, StylistListResponse, VideoResponse};

/// Upload cap for the roast form and the imagine JSON body.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// How far the orchestrator may run ahead of a slow SSE reader.
const EVENT_BUFFER: usize = 32;

/// Images arrive normalized to JPEG.
const IMAGE_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    orchestrator: OrchestratorConfig,
    video: Option<Arc<VideoPipeline>>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: OrchestratorConfig,
        video: Option<Arc<VideoPipeline>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            video,
            shutdown,
        }
    }

    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Self {
        let http = Arc::new(HttpDispatch::new());
        let registry = Arc::new(Registry::from_config(config, http.clone()));
        let video = config
            .video
            .as_ref()
            .map(|video| Arc::new(VideoPipeline::from_config(http.clone(), video)));
        Self::new(registry, config.orchestrator.clone(), video, shutdown)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stylists", get(list_stylists))
        .route("/api/roast", post(roast))
        .route("/api/imagine", post(imagine))
        .route("/api/animate", post(animate))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_stylists(State(state): State<AppState>) -> Json<StylistListResponse> {
    Json(StylistListResponse {
        stylists: state
            .registry
            .profiles()
            .into_iter()
            .map(Into::into)
            .collect(),
    })
}

/// Pull the `image` field out of the form. Other fields are ignored.
async fn read_image_field(multipart: &mut Multipart) -> Result<Option<Vec<u8>>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid form data: {e}")))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read image: {e}")))?;
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(bytes.to_vec()));
        }
    }
    Ok(None)
}

/// Stream the roast/clapback run for one uploaded image as server-sent events.
async fn roast(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let bytes = match read_image_field(&mut multipart).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return (StatusCode::BAD_REQUEST, "No image provided").into_response(),
        Err(e) => return e.into_response(),
    };
    let image = ImageInput::from_bytes(&bytes, IMAGE_MEDIA_TYPE);
    drop(bytes);

    let (sink, stream) = events::channel(EVENT_BUFFER);
    let cancel = state.shutdown.child_token();
    let orchestrator = Orchestrator::new(
        &state.registry,
        state.orchestrator.clone(),
        sink.clone(),
        cancel.clone(),
    );

    tracing::info!(stylists = state.registry.len(), "roast started");

    // The run owns the sink; the stream ends when this task drops it.
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = orchestrator.run(image) => {}
            _ = sink.closed() => {
                tracing::info!("roast consumer disconnected, cancelling run");
                cancel.cancel();
            }
        }
    });

    let frames = stream
        .into_stream()
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    Sse::new(frames).into_response()
}

fn to_sse_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.payload().to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagineRequest {
    pub suggestion: String,
    pub image_base64: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimateRequest {
    pub edited_image_url: String,
}

fn pipeline(state: &AppState) -> Result<Arc<VideoPipeline>, ApiError> {
    state
        .video
        .clone()
        .ok_or_else(|| ApiError::Unavailable("video generation is not configured".to_string()))
}

/// Malformed or mistyped JSON bodies get the same `{error, kind}` shape as
/// every other rejection.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(req)| req)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

async fn imagine(
    State(state): State<AppState>,
    body: Result<Json<ImagineRequest>, JsonRejection>,
) -> Result<Json<VideoResponse>, ApiError> {
    let req = json_body(body)?;
    if req.suggestion.trim().is_empty() {
        return Err(ApiError::BadRequest("suggestion must not be empty".to_string()));
    }
    if req.image_base64.trim().is_empty() {
        return Err(ApiError::BadRequest("imageBase64 must not be empty".to_string()));
    }
    let image = ImageInput::from_base64(&req.image_base64, IMAGE_MEDIA_TYPE)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let pipeline = pipeline(&state)?;

    // Dropping this future on client disconnect stops the poll loop with it.
    let cancel = state.shutdown.child_token();
    let outcome = pipeline.imagine(&req.suggestion, &image, &cancel).await?;
    Ok(Json(VideoResponse::with_prompt(outcome)))
}

async fn animate(
    State(state): State<AppState>,
    body: Result<Json<AnimateRequest>, JsonRejection>,
) -> Result<Json<VideoResponse>, ApiError> {
    let req = json_body(body)?;
    let url = req.edited_image_url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with("data:")) {
        return Err(ApiError::BadRequest(
            "editedImageUrl must be an http(s) or data URL".to_string(),
        ));
    }
    let pipeline = pipeline(&state)?;
    let cancel = state.shutdown.child_token();
    let outcome = pipeline.animate(url, &cancel).await?;
    Ok(Json(VideoResponse::without_prompt(outcome)))
}
