use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatch::registry::WireFormat;
use crate::dispatch::{ProviderRequest, ProviderResult};
use crate::error::RunwayError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Anthropic requires max_tokens on every request.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 1024;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpDispatch {
    client: Client,
}

// --- OpenAI-compatible chat completions (OpenAI, xAI) ---

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
    refusal: Option<String>,
}

// --- Anthropic messages ---

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

// --- Gemini generateContent ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn query_model(
        &self,
        req: &ProviderRequest,
        provider: &str,
        base_url: &str,
        api_key: &str,
        format: &WireFormat,
    ) -> Result<ProviderResult, RunwayError> {
        let start = Instant::now();

        // Check for expired deadline before making the request
        let timeout = req
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or(RunwayError::Timeout(0))?;

        let url = endpoint_url(format, base_url, &req.model);
        let body = build_request_body(format, req);

        let mut request = self.client.post(&url).timeout(timeout).json(&body);
        for (k, v) in request_headers(format, api_key) {
            request = request.header(k, v);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RunwayError::Timeout(start.elapsed().as_millis() as u64)
            } else {
                RunwayError::Request(e)
            }
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RunwayError::RateLimited {
                provider: provider.to_string(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RunwayError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }

        // Cap error body reads to MAX_RESPONSE_BYTES to prevent memory exhaustion
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(RunwayError::Upstream {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_BYTES
        {
            return Err(RunwayError::Upstream {
                provider: provider.to_string(),
                message: format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
                status: None,
            });
        }

        let bytes = response.bytes().await.map_err(|e| RunwayError::Upstream {
            provider: provider.to_string(),
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(RunwayError::Upstream {
                provider: provider.to_string(),
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
                status: None,
            });
        }

        let text = parse_response(format, provider, &bytes)?;
        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(ProviderResult {
            text,
            model: req.model.clone(),
            provider: provider.to_string(),
            latency_ms,
        })
    }
}

/// Resolve the request URL. Gemini puts the model in the path via `{model}`.
pub fn endpoint_url(format: &WireFormat, base_url: &str, model: &str) -> String {
    match format {
        WireFormat::Gemini => base_url.replace("{model}", model),
        WireFormat::OpenAi | WireFormat::Anthropic => base_url.to_string(),
    }
}

pub fn request_headers(format: &WireFormat, api_key: &str) -> Vec<(&'static str, String)> {
    match format {
        WireFormat::OpenAi => vec![("Authorization", format!("Bearer {api_key}"))],
        WireFormat::Anthropic => vec![
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ],
        WireFormat::Gemini => vec![("x-goog-api-key", api_key.to_string())],
    }
}

/// Build the JSON body for one call. The image, if any, precedes the text
/// instruction in every format.
pub fn build_request_body(format: &WireFormat, req: &ProviderRequest) -> Value {
    match format {
        WireFormat::OpenAi => {
            let content = match &req.image {
                Some(image) => json!([
                    {"type": "image_url", "image_url": {"url": image.data_url()}},
                    {"type": "text", "text": req.prompt},
                ]),
                None => json!(req.prompt),
            };
            let mut body = json!({
                "model": req.model,
                "messages": [{"role": "user", "content": content}],
            });
            if let Some(max) = req.max_tokens {
                body["max_tokens"] = json!(max);
            }
            body
        }
        WireFormat::Anthropic => {
            let content = match &req.image {
                Some(image) => json!([
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.media_type(),
                            "data": image.base64(),
                        },
                    },
                    {"type": "text", "text": req.prompt},
                ]),
                None => json!(req.prompt),
            };
            json!({
                "model": req.model,
                "max_tokens": req.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
                "messages": [{"role": "user", "content": content}],
            })
        }
        WireFormat::Gemini => {
            let mut parts = Vec::new();
            if let Some(image) = &req.image {
                parts.push(json!({
                    "inlineData": {"mimeType": image.media_type(), "data": image.base64()}
                }));
            }
            parts.push(json!({"text": req.prompt}));
            let mut body = json!({"contents": [{"role": "user", "parts": parts}]});
            if let Some(max) = req.max_tokens {
                body["generationConfig"] = json!({"maxOutputTokens": max});
            }
            body
        }
    }
}

/// Extract the reply text, mapping refusals and safety blocks to
/// `ContentRejected` and blank replies to `EmptyResponse`.
pub fn parse_response(
    format: &WireFormat,
    provider: &str,
    bytes: &[u8],
) -> Result<String, RunwayError> {
    let rejected = |message: String| RunwayError::ContentRejected {
        provider: provider.to_string(),
        message,
    };

    let text = match format {
        WireFormat::OpenAi => {
            let completion: ChatCompletion = serde_json::from_slice(bytes)
                .map_err(|e| RunwayError::SchemaParse(format!("failed to parse response: {e}")))?;
            let choice = completion.choices.into_iter().next();
            if let Some(ref c) = choice {
                if let Some(refusal) = c.message.refusal.as_deref().filter(|r| !r.is_empty()) {
                    return Err(rejected(refusal.to_string()));
                }
                if c.finish_reason.as_deref() == Some("content_filter") {
                    return Err(rejected("content_filter".to_string()));
                }
            }
            choice.and_then(|c| c.message.content)
        }
        WireFormat::Anthropic => {
            let message: MessagesResponse = serde_json::from_slice(bytes)
                .map_err(|e| RunwayError::SchemaParse(format!("failed to parse response: {e}")))?;
            if message.stop_reason.as_deref() == Some("refusal") {
                return Err(rejected("refusal".to_string()));
            }
            message
                .content
                .into_iter()
                .find(|b| b.kind == "text")
                .and_then(|b| b.text)
        }
        WireFormat::Gemini => {
            let generated: GenerateContentResponse = serde_json::from_slice(bytes)
                .map_err(|e| RunwayError::SchemaParse(format!("failed to parse response: {e}")))?;
            if let Some(reason) = generated.prompt_feedback.and_then(|f| f.block_reason) {
                return Err(rejected(reason));
            }
            let candidate = generated.candidates.into_iter().next();
            if let Some(ref c) = candidate
                && matches!(c.finish_reason.as_deref(), Some("SAFETY" | "PROHIBITED_CONTENT"))
            {
                return Err(rejected(c.finish_reason.clone().unwrap_or_default()));
            }
            candidate.and_then(|c| c.content).map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
        }
    };

    text.map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RunwayError::EmptyResponse {
            provider: provider.to_string(),
        })
}
