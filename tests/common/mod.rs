//! Scripted stand-ins for providers, video backends and prompt writers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use runway::dispatch::video::{SubmitRequest, VideoApi};
use runway::dispatch::{ImageInput, Stylist, StylistProfile};
use runway::error::RunwayError;
use runway::pipeline::PromptWriter;

// ---------------------------------------------------------------------------
// Stylists
// ---------------------------------------------------------------------------

pub struct ScriptedStylist {
    profile: StylistProfile,
    critique: Result<String, String>,
    reaction: Result<String, String>,
    delay: Duration,
    pub critique_calls: AtomicUsize,
    /// Critiques that ran to the end instead of being dropped mid-call.
    pub critiques_finished: AtomicUsize,
    pub react_calls: AtomicUsize,
    pub summaries: Mutex<Vec<String>>,
}

impl ScriptedStylist {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            profile: StylistProfile {
                id: id.to_string(),
                name: name.to_string(),
                icon: "*".to_string(),
            },
            critique: Ok(format!("{name} likes it")),
            reaction: Ok(format!("{name} agrees")),
            delay: Duration::ZERO,
            critique_calls: AtomicUsize::new(0),
            critiques_finished: AtomicUsize::new(0),
            react_calls: AtomicUsize::new(0),
            summaries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_critique(mut self, message: &str) -> Self {
        self.critique = Err(message.to_string());
        self
    }

    pub fn failing_reaction(mut self, message: &str) -> Self {
        self.reaction = Err(message.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn reply(&self, scripted: &Result<String, String>) -> Result<String, RunwayError> {
        scripted.clone().map_err(|message| RunwayError::Upstream {
            provider: self.profile.id.clone(),
            message,
            status: None,
        })
    }
}

#[async_trait]
impl Stylist for ScriptedStylist {
    fn profile(&self) -> &StylistProfile {
        &self.profile
    }

    async fn critique(&self, _image: &ImageInput) -> Result<String, RunwayError> {
        self.critique_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.critiques_finished.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.critique)
    }

    async fn react(&self, summary: &str) -> Result<String, RunwayError> {
        self.react_calls.fetch_add(1, Ordering::SeqCst);
        self.summaries.lock().unwrap().push(summary.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply(&self.reaction)
    }
}

pub fn as_dyn(stylists: &[Arc<ScriptedStylist>]) -> Vec<Arc<dyn Stylist>> {
    stylists
        .iter()
        .map(|s| s.clone() as Arc<dyn Stylist>)
        .collect()
}

pub fn test_image() -> ImageInput {
    ImageInput::from_bytes(&[0xFF, 0xD8, 0xFF, 0xE0], "image/jpeg")
}

// ---------------------------------------------------------------------------
// Video backend
// ---------------------------------------------------------------------------

pub enum StatusReply {
    Body(Value),
    Transient,
    Auth,
}

pub struct ScriptedVideoApi {
    submit_reply: Value,
    statuses: Mutex<VecDeque<StatusReply>>,
    /// Returned once the script runs out.
    fallback: Value,
    pub status_calls: AtomicU32,
    pub submitted: Mutex<Vec<SubmitRequest>>,
}

impl ScriptedVideoApi {
    pub fn new(submit_reply: Value) -> Self {
        Self {
            submit_reply,
            statuses: Mutex::new(VecDeque::new()),
            fallback: json!({"status": "pending"}),
            status_calls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn pending_job() -> Self {
        Self::new(json!({"request_id": "job-1"}))
    }

    pub fn then(self, reply: StatusReply) -> Self {
        self.statuses.lock().unwrap().push_back(reply);
        self
    }

    pub fn then_pending(self, times: usize) -> Self {
        (0..times).fold(self, |api, _| {
            api.then(StatusReply::Body(json!({"status": "pending"})))
        })
    }

    pub fn calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl VideoApi for ScriptedVideoApi {
    async fn submit(&self, req: &SubmitRequest) -> Result<Value, RunwayError> {
        self.submitted.lock().unwrap().push(req.clone());
        Ok(self.submit_reply.clone())
    }

    async fn status(&self, _job_id: &str) -> Result<Value, RunwayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        match next {
            Some(StatusReply::Body(body)) => Ok(body),
            Some(StatusReply::Transient) => Err(RunwayError::Upstream {
                provider: "xai".to_string(),
                message: "poll returned HTTP 503".to_string(),
                status: Some(503),
            }),
            Some(StatusReply::Auth) => Err(RunwayError::AuthFailed {
                provider: "xai".to_string(),
                message: "poll HTTP 401".to_string(),
            }),
            None => Ok(self.fallback.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt writer
// ---------------------------------------------------------------------------

pub struct ScriptedWriter {
    reply: Result<String, String>,
    pub calls: AtomicUsize,
}

impl ScriptedWriter {
    pub fn ok(prompt: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(prompt.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PromptWriter for ScriptedWriter {
    async fn animation_prompt(&self, _suggestion: &str) -> Result<String, RunwayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map_err(|message| RunwayError::Upstream {
            provider: "xai".to_string(),
            message,
            status: Some(500),
        })
    }
}
