use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::Config;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{ImageInput, ProviderRequest, Stylist, StylistProfile};
use crate::error::RunwayError;

/// Request/response shape spoken by a provider's HTTP API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// OpenAI-compatible chat completions (OpenAI, xAI). Images as data URLs.
    #[default]
    OpenAi,
    /// Anthropic Messages API. Images as base64 source blocks.
    Anthropic,
    /// Gemini generateContent. Images as inlineData parts.
    Gemini,
}

/// Prompt-shaping data owned by one stylist. The orchestrator never looks inside.
#[derive(Clone, Debug)]
pub struct Persona {
    pub critique_model: String,
    pub reaction_model: String,
    pub critique_prompt: String,
    /// Template with a `{summary}` slot for the combined critiques.
    pub reaction_prompt: String,
    pub critique_max_tokens: Option<u64>,
    pub reaction_max_tokens: Option<u64>,
}

impl Persona {
    pub fn reaction_instruction(&self, summary: &str) -> String {
        self.reaction_prompt.replace("{summary}", summary)
    }
}

#[derive(Clone)]
pub struct StylistEntry {
    pub profile: StylistProfile,
    /// Provider name used in errors and logs (e.g. "anthropic", "xai").
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub format: WireFormat,
    pub persona: Persona,
}

impl std::fmt::Debug for StylistEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StylistEntry")
            .field("id", &self.profile.id)
            .field("name", &self.profile.name)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("format", &self.format)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// A stylist backed by one of the HTTP wire formats.
pub struct HttpStylist {
    entry: StylistEntry,
    http: Arc<HttpDispatch>,
    call_timeout: Duration,
}

impl HttpStylist {
    pub fn new(entry: StylistEntry, http: Arc<HttpDispatch>, call_timeout: Duration) -> Self {
        Self {
            entry,
            http,
            call_timeout,
        }
    }

    pub fn entry(&self) -> &StylistEntry {
        &self.entry
    }

    async fn call(&self, req: ProviderRequest) -> Result<String, RunwayError> {
        let result = self
            .http
            .query_model(
                &req,
                &self.entry.provider,
                &self.entry.base_url,
                &self.entry.api_key,
                &self.entry.format,
            )
            .await?;
        tracing::debug!(
            stylist = %self.entry.profile.id,
            model = %result.model,
            latency_ms = result.latency_ms,
            "provider call finished"
        );
        Ok(result.text)
    }
}

#[async_trait]
impl Stylist for HttpStylist {
    fn profile(&self) -> &StylistProfile {
        &self.entry.profile
    }

    async fn critique(&self, image: &ImageInput) -> Result<String, RunwayError> {
        let persona = &self.entry.persona;
        self.call(ProviderRequest {
            prompt: persona.critique_prompt.clone(),
            model: persona.critique_model.clone(),
            image: Some(image.clone()),
            max_tokens: persona.critique_max_tokens,
            deadline: Instant::now() + self.call_timeout,
        })
        .await
    }

    async fn react(&self, summary: &str) -> Result<String, RunwayError> {
        let persona = &self.entry.persona;
        self.call(ProviderRequest {
            prompt: persona.reaction_instruction(summary),
            model: persona.reaction_model.clone(),
            image: None,
            max_tokens: persona.reaction_max_tokens,
            deadline: Instant::now() + self.call_timeout,
        })
        .await
    }
}

/// Ordered, read-only set of stylists built once at startup.
/// Registration order drives event order.
pub struct Registry {
    stylists: Vec<Arc<dyn Stylist>>,
}

impl Registry {
    /// Build from an explicit registration list. Later duplicates of an id are dropped.
    pub fn new(stylists: Vec<Arc<dyn Stylist>>) -> Self {
        let mut seen = HashSet::new();
        let stylists = stylists
            .into_iter()
            .filter(|s| {
                let fresh = seen.insert(s.id().to_string());
                if !fresh {
                    tracing::warn!(stylist = s.id(), "duplicate stylist registration ignored");
                }
                fresh
            })
            .collect();
        Self { stylists }
    }

    /// Every stylist shares `http`, and with it one connection pool.
    pub fn from_config(config: &Config, http: Arc<HttpDispatch>) -> Self {
        let call_timeout = config.orchestrator.call_timeout;
        let stylists = config
            .stylists
            .iter()
            .cloned()
            .map(|entry| {
                Arc::new(HttpStylist::new(entry, http.clone(), call_timeout)) as Arc<dyn Stylist>
            })
            .collect();
        Self::new(stylists)
    }

    pub fn stylists(&self) -> &[Arc<dyn Stylist>] {
        &self.stylists
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Stylist>> {
        self.stylists.iter().find(|s| s.id() == id)
    }

    pub fn profiles(&self) -> Vec<StylistProfile> {
        self.stylists.iter().map(|s| s.profile().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stylists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stylists.is_empty()
    }
}
