use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::StylistProfile;
use crate::dispatch::registry::{Persona, StylistEntry, WireFormat};
use crate::error::RunwayError;

pub const DEFAULT_CONFIG_FILE: &str = "runway.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_STYLISTS: &[&str] = &["claude", "grok", "gpt"];

const XAI_CHAT_URL: &str = "https://api.x.ai/v1/chat/completions";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const GEMINI_GENERATE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent";

/// How the orchestrator schedules provider calls within a phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Sequential,
    /// Fan out on a bounded pool, then re-sequence into registration order.
    Concurrent,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub mode: DispatchMode,
    pub max_concurrency: usize,
    pub min_critiques_for_reactions: usize,
    /// Whether a stylist whose own critique failed still gets to react.
    pub failed_critics_react: bool,
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Sequential,
            max_concurrency: 4,
            min_critiques_for_reactions: 2,
            failed_critics_react: true,
            call_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct VideoConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub prompt_model: String,
    pub duration_secs: u32,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl VideoConfig {
    pub fn with_key(api_key: String) -> Self {
        Self {
            base_url: "https://api.x.ai/v1".to_string(),
            api_key,
            model: "grok-imagine-video".to_string(),
            prompt_model: "grok-3".to_string(),
            duration_secs: 6,
            poll_interval: Duration::from_millis(2000),
            max_attempts: 90,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for VideoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("prompt_model", &self.prompt_model)
            .field("duration_secs", &self.duration_secs)
            .field("poll_interval", &self.poll_interval)
            .field("max_attempts", &self.max_attempts)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Provider credentials. Empty values count as unset.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub xai: Option<String>,
    pub openai: Option<String>,
    pub gemini: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            anthropic: read("ANTHROPIC_API_KEY"),
            xai: read("XAI_API_KEY"),
            openai: read("OPENAI_API_KEY"),
            gemini: read("GEMINI_API_KEY"),
        }
    }
}

// --- TOML file shape (every field optional) ---

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub stylists: Option<Vec<String>>,
    pub orchestrator: OrchestratorFile,
    pub video: VideoFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorFile {
    pub mode: Option<DispatchMode>,
    pub max_concurrency: Option<usize>,
    pub min_critiques_for_reactions: Option<usize>,
    pub failed_critics_react: Option<bool>,
    pub call_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoFile {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub prompt_model: Option<String>,
    pub duration_secs: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug)]
pub struct Config {
    pub bind: SocketAddr,
    /// Registered stylists in event order.
    pub stylists: Vec<StylistEntry>,
    pub orchestrator: OrchestratorConfig,
    /// None when no xAI key is configured; the video endpoints are then unavailable.
    pub video: Option<VideoConfig>,
}

impl Config {
    /// Defaults plus whatever credentials the environment provides.
    pub fn from_env() -> Self {
        match Self::build(FileConfig::default(), &ApiKeys::from_env()) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("default config rejected: {e}");
                Self {
                    bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
                    stylists: Vec::new(),
                    orchestrator: OrchestratorConfig::default(),
                    video: None,
                }
            }
        }
    }

    /// Load `RUNWAY_CONFIG` (must exist if set) or `./runway.toml` (optional).
    pub fn load() -> Result<Self, RunwayError> {
        let (path, required) = match env::var("RUNWAY_CONFIG") {
            Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let file = if path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            read_file_config(&path)?
        } else if required {
            return Err(RunwayError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            FileConfig::default()
        };

        Self::build(file, &ApiKeys::from_env())
    }

    pub fn from_toml_str(text: &str, keys: &ApiKeys) -> Result<Self, RunwayError> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| RunwayError::Config(e.to_string()))?;
        Self::build(file, keys)
    }

    pub fn build(file: FileConfig, keys: &ApiKeys) -> Result<Self, RunwayError> {
        let bind_text = file.bind.as_deref().unwrap_or(DEFAULT_BIND);
        let bind: SocketAddr = bind_text
            .parse()
            .map_err(|e| RunwayError::Config(format!("invalid bind address {bind_text}: {e}")))?;

        let defaults = OrchestratorConfig::default();
        let o = file.orchestrator;
        let orchestrator = OrchestratorConfig {
            mode: o.mode.unwrap_or(defaults.mode),
            max_concurrency: o.max_concurrency.unwrap_or(defaults.max_concurrency),
            min_critiques_for_reactions: o
                .min_critiques_for_reactions
                .unwrap_or(defaults.min_critiques_for_reactions),
            failed_critics_react: o
                .failed_critics_react
                .unwrap_or(defaults.failed_critics_react),
            call_timeout: o
                .call_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
        };
        if orchestrator.max_concurrency == 0 {
            return Err(RunwayError::Config(
                "orchestrator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if orchestrator.min_critiques_for_reactions < 2 {
            return Err(RunwayError::Config(
                "orchestrator.min_critiques_for_reactions must be at least 2".to_string(),
            ));
        }
        if orchestrator.call_timeout.is_zero() {
            return Err(RunwayError::Config(
                "orchestrator.call_timeout_secs must be positive".to_string(),
            ));
        }

        let requested: Vec<String> = file
            .stylists
            .unwrap_or_else(|| DEFAULT_STYLISTS.iter().map(|s| s.to_string()).collect());
        let stylists = register_stylists(&requested, keys);

        let video = match &keys.xai {
            Some(key) => Some(build_video_config(file.video, key.clone())?),
            None => {
                tracing::warn!("XAI_API_KEY not set, video generation unavailable");
                None
            }
        };

        if stylists.is_empty() {
            tracing::error!("no stylists configured, roast streams will be empty");
        }

        Ok(Config {
            bind,
            stylists,
            orchestrator,
            video,
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, RunwayError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RunwayError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| RunwayError::Config(format!("{}: {e}", path.display())))
}

fn build_video_config(file: VideoFile, api_key: String) -> Result<VideoConfig, RunwayError> {
    let mut video = VideoConfig::with_key(api_key);
    if let Some(url) = file.base_url {
        video.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(model) = file.model {
        video.model = model;
    }
    if let Some(model) = file.prompt_model {
        video.prompt_model = model;
    }
    if let Some(d) = file.duration_secs {
        video.duration_secs = d;
    }
    if let Some(ms) = file.poll_interval_ms {
        video.poll_interval = Duration::from_millis(ms);
    }
    if let Some(n) = file.max_attempts {
        video.max_attempts = n;
    }
    if let Some(secs) = file.request_timeout_secs {
        video.request_timeout = Duration::from_secs(secs);
    }
    if video.max_attempts == 0 {
        return Err(RunwayError::Config(
            "video.max_attempts must be at least 1".to_string(),
        ));
    }
    if video.request_timeout.is_zero() {
        return Err(RunwayError::Config(
            "video.request_timeout_secs must be positive".to_string(),
        ));
    }
    Ok(video)
}

enum CatalogueLookup {
    Ready(Box<StylistEntry>),
    MissingKey(&'static str),
    Unknown,
}

/// Resolve the requested ids against the built-in catalogue, in order.
/// Unknown ids, missing credentials and duplicates are skipped with a warning.
pub fn register_stylists(requested: &[String], keys: &ApiKeys) -> Vec<StylistEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for id in requested {
        let id = id.trim();
        if !seen.insert(id.to_string()) {
            tracing::warn!(stylist = id, "stylist listed twice, keeping first");
            continue;
        }
        match catalogue_entry(id, keys) {
            CatalogueLookup::Ready(entry) => entries.push(*entry),
            CatalogueLookup::MissingKey(var) => {
                tracing::warn!(stylist = id, "{var} not set, stylist unavailable");
            }
            CatalogueLookup::Unknown => {
                tracing::warn!(stylist = id, "unknown stylist id, skipping");
            }
        }
    }
    entries
}

fn catalogue_entry(id: &str, keys: &ApiKeys) -> CatalogueLookup {
    let profile = |name: &str, icon: &str| StylistProfile {
        id: id.to_string(),
        name: name.to_string(),
        icon: icon.to_string(),
    };

    let entry = match id {
        "claude" => {
            let Some(key) = keys.anthropic.clone() else {
                return CatalogueLookup::MissingKey("ANTHROPIC_API_KEY");
            };
            StylistEntry {
                profile: profile("Style Sage", "\u{2728}"),
                provider: "anthropic".to_string(),
                base_url: ANTHROPIC_MESSAGES_URL.to_string(),
                api_key: key,
                format: WireFormat::Anthropic,
                persona: persona(
                    "claude-sonnet-4-20250514",
                    "claude-sonnet-4-20250514",
                    "Style Sage",
                    "a warm, encouraging fashion consultant who celebrates what works in an outfit \
                     and offers one gentle suggestion",
                    "Add an encouraging thought that builds on what someone else said. Be warm and supportive.",
                ),
            }
        }
        "grok" => {
            let Some(key) = keys.xai.clone() else {
                return CatalogueLookup::MissingKey("XAI_API_KEY");
            };
            StylistEntry {
                profile: profile("Vibe Check", "\u{1F525}"),
                provider: "xai".to_string(),
                base_url: XAI_CHAT_URL.to_string(),
                api_key: key,
                format: WireFormat::OpenAi,
                persona: persona(
                    "grok-2-vision-latest",
                    "grok-3",
                    "Vibe Check",
                    "an enthusiastic street style expert who hypes up the pieces that pop and the \
                     energy of the fit",
                    "Add more hype! Build on what someone else said with extra enthusiasm.",
                ),
            }
        }
        "gemini" => {
            let Some(key) = keys.gemini.clone() else {
                return CatalogueLookup::MissingKey("GEMINI_API_KEY");
            };
            StylistEntry {
                profile: profile("Luxe Lens", "\u{1F48E}"),
                provider: "gemini".to_string(),
                base_url: GEMINI_GENERATE_URL.to_string(),
                api_key: key,
                format: WireFormat::Gemini,
                persona: persona(
                    "gemini-1.5-flash",
                    "gemini-1.5-flash",
                    "Luxe Lens",
                    "a high-fashion stylist who finds runway elegance in the silhouette, colour \
                     story and styling details",
                    "Add a sophisticated, encouraging observation that builds on someone else's point.",
                ),
            }
        }
        "gpt" => {
            let Some(key) = keys.openai.clone() else {
                return CatalogueLookup::MissingKey("OPENAI_API_KEY");
            };
            StylistEntry {
                profile: profile("Closet Coach", "\u{1F454}"),
                provider: "openai".to_string(),
                base_url: OPENAI_CHAT_URL.to_string(),
                api_key: key,
                format: WireFormat::OpenAi,
                persona: persona(
                    "gpt-4o",
                    "gpt-4o",
                    "Closet Coach",
                    "a friendly personal stylist who highlights the smart choices in an outfit and \
                     shares one easy tip",
                    "Add a friendly, practical thought that supports what someone else said.",
                ),
            }
        }
        _ => return CatalogueLookup::Unknown,
    };
    CatalogueLookup::Ready(Box::new(entry))
}

fn persona(
    critique_model: &str,
    reaction_model: &str,
    name: &str,
    character: &str,
    reaction_ask: &str,
) -> Persona {
    Persona {
        critique_model: critique_model.to_string(),
        reaction_model: reaction_model.to_string(),
        critique_prompt: format!(
            "You are {name}, {character}. Start with \"{}:\" and give 2-3 sentences of feedback \
             on this outfit.",
            name.to_uppercase()
        ),
        reaction_prompt: format!(
            "You are {name}. Other stylists gave feedback:\n\n{{summary}}\n\n{reaction_ask} \
             1-2 sentences. Start with their name."
        ),
        critique_max_tokens: Some(300),
        reaction_max_tokens: Some(150),
    }
}
