pub mod http;
pub mod registry;
pub mod video;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::RunwayError;

/// An image that has already been decoded and normalized upstream.
/// Held base64-encoded because every wire format wants it that way;
/// cloning is cheap so concurrent calls can share one encoding.
#[derive(Clone, Debug)]
pub struct ImageInput {
    media_type: Arc<str>,
    base64: Arc<str>,
}

impl ImageInput {
    pub fn from_bytes(bytes: &[u8], media_type: &str) -> Self {
        Self {
            media_type: media_type.into(),
            base64: STANDARD.encode(bytes).into(),
        }
    }

    /// Accept an already-encoded image, rejecting anything that isn't valid base64.
    pub fn from_base64(encoded: &str, media_type: &str) -> Result<Self, RunwayError> {
        let trimmed = encoded.trim();
        STANDARD
            .decode(trimmed)
            .map_err(|e| RunwayError::Other(format!("invalid base64 image: {e}")))?;
        Ok(Self {
            media_type: media_type.into(),
            base64: trimmed.into(),
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn base64(&self) -> &str {
        &self.base64
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.base64)
    }
}

/// Internal request type shared by every wire format.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    /// Present for critiques, absent for text-only calls (reactions, prompt writing).
    pub image: Option<ImageInput>,
    pub max_tokens: Option<u64>,
    pub deadline: Instant,
}

/// Internal result type returned by every wire format.
#[derive(Debug)]
pub struct ProviderResult {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub latency_ms: u64,
}

/// Public identity of a stylist. Personas stay private to the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StylistProfile {
    pub id: String,
    pub name: String,
    pub icon: String,
}

/// One external critique provider behind a uniform contract.
///
/// Implementations make exactly one outbound call per method and never
/// retry. Retry and isolation policy belong to the orchestrator.
#[async_trait]
pub trait Stylist: Send + Sync {
    fn profile(&self) -> &StylistProfile;

    /// Short critique of the image.
    async fn critique(&self, image: &ImageInput) -> Result<String, RunwayError>;

    /// Short reaction to the combined critique summary. The persona's prompt
    /// asks the provider to address another stylist by name; the reply is not
    /// checked for it.
    async fn react(&self, summary: &str) -> Result<String, RunwayError>;

    fn id(&self) -> &str {
        &self.profile().id
    }

    fn name(&self) -> &str {
        &self.profile().name
    }
}
