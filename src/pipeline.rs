use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::VideoConfig;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::registry::WireFormat;
use crate::dispatch::video::{JobPoller, PollSettings, SubmitRequest, XaiVideoApi};
use crate::dispatch::{ImageInput, ProviderRequest};
use crate::error::RunwayError;

/// Instruction used by `animate`, which has no critique to work from.
pub const SHOWCASE_PROMPT: &str = "The person confidently turns to show their outfit from \
    different angles, with a subtle smile. Smooth, elegant motion like a fashion showcase.";

/// Turns a stylist's suggestion into a short animation instruction.
#[async_trait]
pub trait PromptWriter: Send + Sync {
    async fn animation_prompt(&self, suggestion: &str) -> Result<String, RunwayError>;
}

/// Prompt writer backed by an OpenAI-compatible text model.
pub struct HttpPromptWriter {
    http: Arc<HttpDispatch>,
    url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpPromptWriter {
    pub fn new(http: Arc<HttpDispatch>, config: &VideoConfig) -> Self {
        Self {
            http,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.prompt_model.clone(),
            timeout: config.request_timeout,
        }
    }
}

pub fn animation_instruction(suggestion: &str) -> String {
    format!(
        "Based on this fashion advice: \"{suggestion}\"\n\n\
         Write a short, vivid video animation prompt (1-2 sentences) describing the person in \
         the photo confidently modeling the style, with natural movement such as turning to \
         show different angles, adjusting an accessory, or striking a pose. \
         Start directly with the animation description."
    )
}

#[async_trait]
impl PromptWriter for HttpPromptWriter {
    async fn animation_prompt(&self, suggestion: &str) -> Result<String, RunwayError> {
        let req = ProviderRequest {
            prompt: animation_instruction(suggestion),
            model: self.model.clone(),
            image: None,
            max_tokens: None,
            deadline: Instant::now() + self.timeout,
        };
        let result = self
            .http
            .query_model(&req, "xai", &self.url, &self.api_key, &WireFormat::OpenAi)
            .await?;
        Ok(result.text)
    }
}

/// Terminal success of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutcome {
    pub url: String,
    pub prompt: String,
    pub attempts: u32,
}

/// Suggestion → animation prompt → video job → URL.
///
/// A failed prompt step ends the run; there is no fallback instruction.
pub struct VideoPipeline {
    writer: Arc<dyn PromptWriter>,
    poller: JobPoller,
    model: String,
    duration_secs: u32,
}

impl VideoPipeline {
    pub fn new(
        writer: Arc<dyn PromptWriter>,
        poller: JobPoller,
        model: impl Into<String>,
        duration_secs: u32,
    ) -> Self {
        Self {
            writer,
            poller,
            model: model.into(),
            duration_secs,
        }
    }

    pub fn from_config(http: Arc<HttpDispatch>, config: &VideoConfig) -> Self {
        let api = XaiVideoApi::from_config(http.client().clone(), config);
        let poller = JobPoller::new(Arc::new(api), PollSettings::from(config));
        let writer = HttpPromptWriter::new(http, config);
        Self::new(
            Arc::new(writer),
            poller,
            config.model.clone(),
            config.duration_secs,
        )
    }

    /// Generate a prompt from `suggestion` and animate `image` with it.
    pub async fn imagine(
        &self,
        suggestion: &str,
        image: &ImageInput,
        cancel: &CancellationToken,
    ) -> Result<VideoOutcome, RunwayError> {
        let prompt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunwayError::Cancelled),
            prompt = self.writer.animation_prompt(suggestion) => prompt,
        };
        let prompt = match prompt {
            Ok(p) if !p.trim().is_empty() => p.trim().to_string(),
            Ok(_) => {
                return Err(RunwayError::PromptGeneration {
                    message: "empty animation prompt".to_string(),
                });
            }
            Err(RunwayError::Cancelled) => return Err(RunwayError::Cancelled),
            Err(e) => {
                tracing::warn!("animation prompt failed: {e}");
                return Err(RunwayError::PromptGeneration {
                    message: e.to_string(),
                });
            }
        };
        tracing::info!(prompt_len = prompt.len(), "animation prompt ready");

        self.submit(prompt, image.data_url(), cancel).await
    }

    /// Animate a publicly reachable image with the fixed showcase instruction.
    pub async fn animate(
        &self,
        image_url: &str,
        cancel: &CancellationToken,
    ) -> Result<VideoOutcome, RunwayError> {
        self.submit(SHOWCASE_PROMPT.to_string(), image_url.to_string(), cancel)
            .await
    }

    async fn submit(
        &self,
        prompt: String,
        image_url: String,
        cancel: &CancellationToken,
    ) -> Result<VideoOutcome, RunwayError> {
        let req = SubmitRequest {
            model: self.model.clone(),
            prompt,
            image_url,
            duration: self.duration_secs,
        };
        let report = self.poller.run(&req, cancel).await?;
        Ok(VideoOutcome {
            url: report.url,
            prompt: req.prompt,
            attempts: report.attempts,
        })
    }
}
