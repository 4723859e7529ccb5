use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchMode, OrchestratorConfig};
use crate::dispatch::registry::Registry;
use crate::dispatch::{ImageInput, Stylist};
use crate::error::RunwayError;
use crate::events::{EventSink, Phase, ProgressEvent};

pub const REACTION_STATUS_MESSAGE: &str = "Generating clapbacks...";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CritiqueResult {
    pub provider_id: String,
    pub name: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionResult {
    pub provider_id: String,
    pub name: String,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    CritiquePhase,
    ReactionPhase,
    Done,
}

/// What one request produced. Events already carried all of this; the
/// outcome exists for logging and callers that run without a live consumer.
#[derive(Debug)]
pub struct RunOutcome {
    pub critiques: Vec<CritiqueResult>,
    pub reactions: Vec<ReactionResult>,
    pub critique_failures: usize,
    pub reaction_failures: usize,
    pub reaction_phase_ran: bool,
    /// False when the run was cancelled before `complete` was emitted.
    pub completed: bool,
    pub final_state: OrchestratorState,
    pub elapsed_ms: u64,
}

/// Work item handed to a stylist. Cheap to clone across worker tasks.
#[derive(Clone)]
enum Call {
    Critique(ImageInput),
    React(Arc<str>),
}

/// Build the reaction-phase summary: one `Name: "critique"` paragraph per
/// successful critique, in registration order.
pub fn build_summary(critiques: &[CritiqueResult]) -> String {
    critiques
        .iter()
        .map(|c| format!("{}: \"{}\"", c.name, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Two-phase roast/clapback run over one image.
///
/// Owns every piece of per-request state and is consumed by `run`:
/// - critique phase: each stylist in order, failures isolated
/// - reaction phase: only with enough successful critiques
/// - `complete` is emitted exactly once unless cancelled
pub struct Orchestrator {
    stylists: Vec<Arc<dyn Stylist>>,
    config: OrchestratorConfig,
    sink: EventSink,
    cancel: CancellationToken,
    state: OrchestratorState,
    critiques: Vec<CritiqueResult>,
    reactions: Vec<ReactionResult>,
    /// Indexed like `stylists`; true where the critique succeeded.
    critique_ok: Vec<bool>,
    critique_failures: usize,
    reaction_failures: usize,
}

impl Orchestrator {
    pub fn new(
        registry: &Registry,
        config: OrchestratorConfig,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_stylists(registry.stylists().to_vec(), config, sink, cancel)
    }

    pub fn with_stylists(
        stylists: Vec<Arc<dyn Stylist>>,
        config: OrchestratorConfig,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let n = stylists.len();
        Self {
            stylists,
            config,
            sink,
            cancel,
            state: OrchestratorState::Idle,
            critiques: Vec::new(),
            reactions: Vec::new(),
            critique_ok: vec![false; n],
            critique_failures: 0,
            reaction_failures: 0,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub async fn run(mut self, image: ImageInput) -> RunOutcome {
        let start = Instant::now();
        let mut reaction_phase_ran = false;

        let completed = match self.drive(image, &mut reaction_phase_ran).await {
            Ok(()) => true,
            Err(e) => {
                // Only cancellation escapes `drive`; everything else is isolated per stylist.
                tracing::info!(state = ?self.state, "roast run stopped: {e}");
                self.cancel.cancel();
                false
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            critiques = self.critiques.len(),
            reactions = self.reactions.len(),
            critique_failures = self.critique_failures,
            reaction_failures = self.reaction_failures,
            completed,
            elapsed_ms,
            "roast run finished"
        );

        RunOutcome {
            critiques: self.critiques,
            reactions: self.reactions,
            critique_failures: self.critique_failures,
            reaction_failures: self.reaction_failures,
            reaction_phase_ran,
            completed,
            final_state: self.state,
            elapsed_ms,
        }
    }

    async fn drive(
        &mut self,
        image: ImageInput,
        reaction_phase_ran: &mut bool,
    ) -> Result<(), RunwayError> {
        self.enter(OrchestratorState::CritiquePhase);
        let everyone: Vec<usize> = (0..self.stylists.len()).collect();
        self.run_phase(Phase::Critique, &everyone, Call::Critique(image))
            .await?;

        let needed = self.config.min_critiques_for_reactions.max(2);
        if self.critiques.len() >= needed {
            self.enter(OrchestratorState::ReactionPhase);
            *reaction_phase_ran = true;
            self.sink
                .emit(ProgressEvent::Status {
                    message: REACTION_STATUS_MESSAGE.to_string(),
                })
                .await?;

            let summary: Arc<str> = build_summary(&self.critiques).into();
            let reactors: Vec<usize> = if self.config.failed_critics_react {
                everyone
            } else {
                everyone
                    .into_iter()
                    .filter(|&i| self.critique_ok[i])
                    .collect()
            };
            self.run_phase(Phase::Reaction, &reactors, Call::React(summary))
                .await?;
        } else {
            tracing::info!(
                critiques = self.critiques.len(),
                needed,
                "not enough critiques, skipping reactions"
            );
        }

        self.enter(OrchestratorState::Done);
        self.sink.emit(ProgressEvent::SequenceComplete).await
    }

    fn enter(&mut self, next: OrchestratorState) {
        tracing::debug!(from = ?self.state, to = ?next, "orchestrator transition");
        self.state = next;
    }

    async fn run_phase(
        &mut self,
        phase: Phase,
        participants: &[usize],
        call: Call,
    ) -> Result<(), RunwayError> {
        match self.config.mode {
            DispatchMode::Sequential => self.run_sequential(phase, participants, call).await,
            DispatchMode::Concurrent => self.run_concurrent(phase, participants, call).await,
        }
    }

    async fn run_sequential(
        &mut self,
        phase: Phase,
        participants: &[usize],
        call: Call,
    ) -> Result<(), RunwayError> {
        for &index in participants {
            if self.cancel.is_cancelled() {
                return Err(RunwayError::Cancelled);
            }
            let stylist = self.stylists[index].clone();
            self.emit_start(phase, index).await?;
            let result =
                invoke(stylist, call.clone(), self.config.call_timeout, self.cancel.clone()).await;
            self.record(phase, index, result).await?;
        }
        Ok(())
    }

    /// Fan out on a bounded pool, then re-sequence: the start event for a
    /// stylist goes out once everyone ahead of it has reported, so the stream
    /// reads exactly like a sequential run.
    async fn run_concurrent(
        &mut self,
        phase: Phase,
        participants: &[usize],
        call: Call,
    ) -> Result<(), RunwayError> {
        let n = participants.len();
        if n == 0 {
            return Ok(());
        }

        let pool = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut task_slots: HashMap<TaskId, usize> = HashMap::new();

        for (slot, &index) in participants.iter().enumerate() {
            let stylist = self.stylists[index].clone();
            let call = call.clone();
            let pool = pool.clone();
            let timeout = self.config.call_timeout;
            let cancel = self.cancel.clone();
            let handle = set.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return (slot, Err(RunwayError::Other("worker pool closed".to_string())));
                };
                (slot, invoke(stylist, call, timeout, cancel).await)
            });
            task_slots.insert(handle.id(), slot);
        }

        let mut pending: Vec<Option<Result<String, RunwayError>>> = (0..n).map(|_| None).collect();
        let mut next = 0;
        self.emit_start(phase, participants[0]).await?;

        while next < n {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    set.abort_all();
                    return Err(RunwayError::Cancelled);
                }
                joined = set.join_next() => joined,
            };

            match joined {
                Some(Ok((slot, result))) => pending[slot] = Some(result),
                Some(Err(join_err)) => {
                    tracing::error!("{phase:?} task failed: {join_err}");
                    if let Some(&slot) = task_slots.get(&join_err.id()) {
                        pending[slot] = Some(Err(RunwayError::Other(
                            "stylist task failed unexpectedly".to_string(),
                        )));
                    }
                }
                None => break,
            }

            while next < n {
                let Some(result) = pending[next].take() else {
                    break;
                };
                if let Err(e) = self.record(phase, participants[next], result).await {
                    set.abort_all();
                    return Err(e);
                }
                next += 1;
                if next < n
                    && let Err(e) = self.emit_start(phase, participants[next]).await
                {
                    set.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn emit_start(&self, phase: Phase, index: usize) -> Result<(), RunwayError> {
        let stylist = &self.stylists[index];
        let event = match phase {
            Phase::Critique => ProgressEvent::ProviderStarted {
                agent: stylist.id().to_string(),
                name: stylist.name().to_string(),
            },
            Phase::Reaction => ProgressEvent::ReactionStarted {
                agent: stylist.id().to_string(),
            },
        };
        tracing::debug!(stylist = stylist.id(), ?phase, "stylist started");
        self.sink.emit(event).await
    }

    async fn record(
        &mut self,
        phase: Phase,
        index: usize,
        result: Result<String, RunwayError>,
    ) -> Result<(), RunwayError> {
        let stylist = self.stylists[index].clone();
        let agent = stylist.id().to_string();
        let name = stylist.name().to_string();

        let event = match result {
            Err(RunwayError::Cancelled) if self.cancel.is_cancelled() => {
                return Err(RunwayError::Cancelled);
            }
            Ok(text) => match phase {
                Phase::Critique => {
                    self.critique_ok[index] = true;
                    self.critiques.push(CritiqueResult {
                        provider_id: agent.clone(),
                        name: name.clone(),
                        text: text.clone(),
                    });
                    ProgressEvent::CritiqueReady {
                        agent,
                        name,
                        body: text,
                    }
                }
                Phase::Reaction => {
                    self.reactions.push(ReactionResult {
                        provider_id: agent.clone(),
                        name: name.clone(),
                        text: text.clone(),
                    });
                    ProgressEvent::ReactionReady {
                        agent,
                        name,
                        body: text,
                    }
                }
            },
            Err(e) => {
                tracing::warn!(
                    stylist = %agent,
                    ?phase,
                    reason = e.reason(),
                    "stylist failed: {e}"
                );
                match phase {
                    Phase::Critique => self.critique_failures += 1,
                    Phase::Reaction => self.reaction_failures += 1,
                }
                ProgressEvent::ProviderFailed {
                    agent,
                    phase,
                    error: e.user_message(),
                }
            }
        };

        self.sink.emit(event).await
    }
}

/// One stylist call bounded by the per-call timeout and the request's cancellation.
async fn invoke(
    stylist: Arc<dyn Stylist>,
    call: Call,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<String, RunwayError> {
    let work = async {
        match &call {
            Call::Critique(image) => stylist.critique(image).await,
            Call::React(summary) => stylist.react(summary).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunwayError::Cancelled),
        result = tokio::time::timeout(timeout, work) => {
            result.unwrap_or_else(|_| Err(RunwayError::Timeout(timeout.as_millis() as u64)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_one_paragraph_per_critique() {
        let critiques = vec![
            CritiqueResult {
                provider_id: "claude".into(),
                name: "Style Sage".into(),
                text: "Lovely".into(),
            },
            CritiqueResult {
                provider_id: "gpt".into(),
                name: "Closet Coach".into(),
                text: "Sharp".into(),
            },
        ];
        assert_eq!(
            build_summary(&critiques),
            "Style Sage: \"Lovely\"\n\nCloset Coach: \"Sharp\""
        );
    }
}
