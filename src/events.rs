use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::RunwayError;

/// Which orchestration phase a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Critique,
    Reaction,
}

/// One progress frame of a roast request, sent as `event: <kind>\ndata: <JSON>\n\n`.
/// A stream ends with `complete` unless the consumer went away first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    ProviderStarted {
        agent: String,
        name: String,
    },
    CritiqueReady {
        agent: String,
        name: String,
        body: String,
    },
    Status {
        message: String,
    },
    ReactionStarted {
        agent: String,
    },
    ReactionReady {
        agent: String,
        name: String,
        body: String,
    },
    ProviderFailed {
        agent: String,
        phase: Phase,
        error: String,
    },
    SequenceComplete,
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderStarted { .. } => "agent-start",
            Self::CritiqueReady { .. } => "roast",
            Self::Status { .. } => "status",
            Self::ReactionStarted { .. } => "clapback-start",
            Self::ReactionReady { .. } => "clapback",
            Self::ProviderFailed { .. } => "agent-error",
            Self::SequenceComplete => "complete",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::ProviderStarted { agent, name } => json!({"agent": agent, "name": name}),
            Self::CritiqueReady { agent, name, body } | Self::ReactionReady { agent, name, body } => {
                json!({"agent": agent, "name": name, "body": body})
            }
            Self::Status { message } => json!({"message": message}),
            Self::ReactionStarted { agent } => json!({"agent": agent}),
            // Critique-phase failures carry no phase field.
            Self::ProviderFailed {
                agent,
                phase: Phase::Critique,
                error,
            } => json!({"agent": agent, "error": error}),
            Self::ProviderFailed {
                agent,
                phase: Phase::Reaction,
                error,
            } => json!({"agent": agent, "phase": "clapback", "error": error}),
            Self::SequenceComplete => json!({}),
        }
    }

    /// Agent id carried by the event, if any.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::ProviderStarted { agent, .. }
            | Self::CritiqueReady { agent, .. }
            | Self::ReactionStarted { agent }
            | Self::ReactionReady { agent, .. }
            | Self::ProviderFailed { agent, .. } => Some(agent),
            Self::Status { .. } | Self::SequenceComplete => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SequenceComplete)
    }

    /// Encode as one SSE frame.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind(), self.payload())
    }
}

/// Producer half. Exactly one orchestrator writes to a sink.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

/// Consumer half, handed to the transport.
pub struct EventStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

/// Create a FIFO channel for one request. `capacity` bounds how far the
/// producer may run ahead of a slow consumer.
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, EventStream { rx })
}

impl EventSink {
    /// Send one event. Fails with `Cancelled` once the consumer has gone.
    pub async fn emit(&self, event: ProgressEvent) -> Result<(), RunwayError> {
        tracing::trace!(kind = event.kind(), agent = ?event.agent(), "emit");
        self.tx.send(event).await.map_err(|_| RunwayError::Cancelled)
    }

    /// Resolves when the consumer half has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event. Returns once all sinks are dropped.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}
