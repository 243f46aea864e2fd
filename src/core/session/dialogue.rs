//! Dialogue turns: one user utterance in, one spoken reply out, with tool
//! rounds in between.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionShared;
use crate::core::dialogue::{DialogueState, DialogueTurn, IllegalTransition, Role, ToolCallRequest, is_legal};
use crate::core::llm::{FunctionSpec, LlmChunk, LlmError};
use crate::core::observability::{Feature, Phase, RequestOutcome};
use crate::core::orchestrator::TransitionCallback;
use crate::core::tools::{ToolAction, ToolCall, ToolOutput};
use crate::core::tts::{AudioPriority, SentenceWriter, TtsError};

use DialogueState::*;

/// Spoken when a turn fails
pub(crate) const APOLOGY: &str = "抱歉，请再试一次";
/// Upper bound on waiting for a reply to finish playing
const PLAYBACK_LIMIT: Duration = Duration::from_secs(180);
const APOLOGY_PLAYBACK_LIMIT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error("Turn cancelled")]
    Cancelled,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    State(#[from] IllegalTransition),
}

type TurnResult<T> = Result<T, TurnError>;

/// Outcome of one tool round.
enum ToolRound {
    /// Tools answered the user directly
    Answered,
    /// Results go back to the model
    Requery,
}

pub(crate) async fn dialogue_task(shared: Arc<SessionShared>, mut inputs: mpsc::Receiver<String>) {
    loop {
        let text = tokio::select! {
            _ = shared.stop.cancelled() => break,
            text = inputs.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        let cancel = shared.begin_turn();
        let mut turn = Turn::new(shared.clone(), cancel);
        turn.run(text).await;
    }
    debug!(session_id = %shared.id, "Dialogue task stopped");
}

struct Turn {
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    /// History snapshot plus the memory note, read-only for the turn
    context: Vec<DialogueTurn>,
    /// Turns produced by this turn, committed at the end
    pending: Vec<DialogueTurn>,
    /// Length of `pending` at the last point the model could resume from
    consistent: usize,
    /// Text spoken in the current round, kept if the round is cut off
    partial: String,
    last_sentence: Option<u64>,
    started: Instant,
    /// Set once the model has shown what the user wants
    intent_traced: bool,
}

impl Turn {
    fn new(shared: Arc<SessionShared>, cancel: CancellationToken) -> Self {
        Self {
            shared,
            cancel,
            context: Vec::new(),
            pending: Vec::new(),
            consistent: 0,
            partial: String::new(),
            last_sentence: None,
            started: Instant::now(),
            intent_traced: false,
        }
    }

    async fn run(&mut self, text: String) {
        let id = self.shared.id;
        info!(session_id = %id, "User: {}", text);
        let outcome = self.respond(&text).await;

        match outcome {
            Ok(()) => {
                self.commit();
                self.shared.core.tracer.record(id, Phase::Total, self.started.elapsed());
                self.shared.settle(
                    &[ProcessingIntent, PlayingTransition, ExecutingTools, GeneratingResponse, Speaking],
                    Idle,
                    "turn_complete",
                );
            }
            Err(TurnError::Cancelled) => {
                self.pending.truncate(self.consistent);
                let partial = std::mem::take(&mut self.partial);
                if !partial.is_empty() {
                    self.pending.push(DialogueTurn::assistant(partial));
                }
                self.commit();
                debug!(session_id = %id, "Turn cancelled");
            }
            Err(e) => {
                warn!(session_id = %id, "Turn failed: {}", e);
                self.pending.truncate(self.consistent);
                self.commit();
                self.recover(&e).await;
            }
        }
    }

    fn commit(&mut self) {
        self.shared.history.lock().extend(self.pending.drain(..));
        self.consistent = 0;
    }

    /// Apologise when the reply can still be spoken, otherwise pass through ERROR.
    async fn recover(&mut self, error: &TurnError) {
        let state = &self.shared.state;
        let spoken = matches!(error, TurnError::Llm(_) | TurnError::Tts(_))
            && state.atomically(|sm| {
                let current = sm.current();
                current == Speaking || (is_legal(current, Speaking) && sm.transition(Speaking, "apology").is_ok())
            });

        if spoken {
            if let Some(sentence_id) = self.shared.say(APOLOGY, AudioPriority::Normal).await {
                self.shared.wait_played(sentence_id, APOLOGY_PLAYBACK_LIMIT).await;
            }
            self.shared.settle(&[Speaking], Idle, "apology_done");
        } else if state.transition(Error, "turn_failed").is_ok() {
            self.shared.settle(&[Error], Idle, "recovered");
        }
    }

    /// Move to `to` unless the turn was interrupted in the meantime.
    fn enter(&self, to: DialogueState, reason: &'static str) -> TurnResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        match self.shared.state.transition(to, reason) {
            Ok(_) => Ok(()),
            Err(_) if self.cancel.is_cancelled() || self.shared.state.current() == Interrupted => {
                Err(TurnError::Cancelled)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn respond(&mut self, text: &str) -> TurnResult<()> {
        let shared = self.shared.clone();
        self.enter(ProcessingIntent, "user_input")?;

        self.context = shared.history.lock().snapshot();
        self.add_memory_note(text).await;
        self.pending.push(DialogueTurn::user(text));
        self.consistent = self.pending.len();

        let max_rounds = shared.core.config.session.max_tool_rounds.max(1);
        for round in 0..max_rounds {
            // the last round must answer in words
            let functions = if round + 1 < max_rounds { self.functions() } else { Vec::new() };
            self.enter(GeneratingResponse, "generate")?;
            let (reply, calls) = self.stream_round(functions).await?;

            if calls.is_empty() {
                if !reply.is_empty() {
                    info!(session_id = %shared.id, "Assistant: {}", reply);
                    self.pending.push(DialogueTurn::assistant(reply));
                }
                self.consistent = self.pending.len();
                break;
            }

            if !reply.is_empty() {
                self.pending.push(DialogueTurn::assistant(reply));
            }
            self.pending.push(DialogueTurn::assistant_tool_calls(calls.clone()));
            match self.run_tools(text, calls).await? {
                ToolRound::Answered => break,
                ToolRound::Requery => continue,
            }
        }

        self.wait_for_playback().await
    }

    async fn add_memory_note(&mut self, text: &str) {
        let started = Instant::now();
        let note = self.shared.memory.query(&self.shared.device_id, text).await;
        self.shared.core.tracer.record(self.shared.id, Phase::MemoryQuery, started.elapsed());
        match note {
            Ok(note) if !note.trim().is_empty() => {
                let position = self.context.iter().take_while(|t| t.role == Role::System).count();
                self.context.insert(position, DialogueTurn::system(format!("相关记忆：{}", note.trim())));
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %self.shared.id, "Memory query failed: {}", e),
        }
    }

    /// Time from the start of the turn to the model's first words or tool call.
    fn trace_intent(&mut self) {
        if !self.intent_traced {
            self.intent_traced = true;
            self.shared
                .core
                .tracer
                .record(self.shared.id, Phase::IntentDetection, self.started.elapsed());
        }
    }

    fn functions(&self) -> Vec<FunctionSpec> {
        self.shared.tools.list_tools().iter().map(|t| t.to_function_spec()).collect()
    }

    fn messages(&self) -> Vec<DialogueTurn> {
        self.context.iter().chain(self.pending.iter()).cloned().collect()
    }

    /// Stream one model reply, speaking text as it arrives.
    async fn stream_round(&mut self, functions: Vec<FunctionSpec>) -> TurnResult<(String, Vec<ToolCallRequest>)> {
        let shared = self.shared.clone();
        let started = Instant::now();
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TurnError::Cancelled),
            stream = shared.llm.chat(self.messages(), functions) => observe_model(&shared, stream, started)?,
        };

        let mut calls = Vec::new();
        let mut speech = None;
        let mut writer: Option<SentenceWriter> = None;
        let mut first_chunk = None;
        self.partial.clear();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TurnError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            if first_chunk.is_none() {
                first_chunk = Some(started.elapsed());
            }
            match observe_model(&shared, chunk, started)? {
                LlmChunk::Text(delta) => {
                    if writer.is_none() {
                        if delta.trim().is_empty() {
                            continue;
                        }
                        self.trace_intent();
                        shared.core.tracer.record(shared.id, Phase::ResponseGeneration, started.elapsed());
                        if shared.state.current() != Speaking {
                            self.enter(Speaking, "first_sentence")?;
                        }
                        speech = Some(shared.speech.lock().await);
                        writer = Some(shared.tts.begin(AudioPriority::Normal).await?);
                    }
                    if let Some(writer) = writer.as_ref() {
                        writer.text(&delta).await?;
                    }
                    self.partial.push_str(&delta);
                }
                LlmChunk::ToolCalls(requested) => {
                    self.trace_intent();
                    calls.extend(requested);
                }
            }
        }

        shared
            .core
            .degradation
            .observe(RequestOutcome::success(first_chunk.unwrap_or_else(|| started.elapsed())));

        if let Some(writer) = writer {
            self.last_sentence = Some(writer.finish().await?);
        }
        drop(speech);
        Ok((std::mem::take(&mut self.partial).trim().to_string(), calls))
    }

    async fn run_tools(&mut self, query: &str, requests: Vec<ToolCallRequest>) -> TurnResult<ToolRound> {
        let shared = self.shared.clone();
        let mut calls = Vec::new();
        let mut results: Vec<(String, ToolOutput)> = Vec::new();
        for request in &requests {
            match ToolCall::from_request(request) {
                Ok(call) => calls.push(call),
                Err(e) => {
                    warn!(session_id = %shared.id, "Tool call {} rejected: {}", request.name, e);
                    results.push((request.id.clone(), ToolOutput::error(e.to_string())));
                }
            }
        }

        // a reply that already started speaking yields to the tool round
        if shared.state.current() == Speaking {
            self.enter(ProcessingIntent, "tool_round")?;
        }
        let transition = !calls.is_empty() && shared.core.flags.is_enabled(Feature::TransitionResponse);
        if transition {
            self.enter(PlayingTransition, "tool_calls")?;
        } else {
            self.enter(ExecutingTools, "tool_calls")?;
        }

        let on_transition: Option<TransitionCallback> = transition.then(|| {
            let shared = shared.clone();
            let callback: TransitionCallback = Box::new(move |text: String| {
                async move {
                    shared.say(&text, AudioPriority::Transition).await;
                    let _ = shared
                        .state
                        .transition_from(&[PlayingTransition], ExecutingTools, "transition_queued");
                }
                .boxed()
            });
            callback
        });

        let ctx = shared.tool_context();
        let outcome = shared.compiler.execute(&ctx, query, calls, on_transition, &self.cancel).await;
        if outcome.cancelled || self.cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        let _ = shared
            .state
            .transition_from(&[PlayingTransition], ExecutingTools, "no_transition");
        info!(
            session_id = %shared.id,
            "Tool round ({:?}): {} tasks, {} errors",
            outcome.intent,
            outcome.tasks.len(),
            outcome.errors.len()
        );

        for task in outcome.tasks {
            let output = task.result.unwrap_or_else(|| {
                ToolOutput::error(task.error.unwrap_or_else(|| format!("{} produced no result", task.call.name)))
            });
            results.push((task.call.id, output));
        }

        let direct = !results.is_empty() && results.iter().all(|(_, output)| output.action == ToolAction::Response);
        for (call_id, output) in &results {
            self.pending.push(DialogueTurn::tool(call_id.clone(), output.content.clone()));
        }

        if !direct {
            self.consistent = self.pending.len();
            return Ok(ToolRound::Requery);
        }

        let reply = results
            .iter()
            .map(|(_, output)| output.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        self.enter(Speaking, "tool_response")?;
        if !reply.is_empty() {
            info!(session_id = %shared.id, "Assistant (tools): {}", reply);
            self.last_sentence = shared.say(&reply, AudioPriority::Normal).await;
            self.pending.push(DialogueTurn::assistant(reply));
        }
        self.consistent = self.pending.len();
        Ok(ToolRound::Answered)
    }

    async fn wait_for_playback(&self) -> TurnResult<()> {
        let Some(sentence_id) = self.last_sentence else {
            return Ok(());
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TurnError::Cancelled),
            played = self.shared.wait_played(sentence_id, PLAYBACK_LIMIT) => {
                if !played {
                    warn!(session_id = %self.shared.id, "Sentence {} never finished playing", sentence_id);
                }
                Ok(())
            }
        }
    }
}

/// Count a failed model request against the degradation window.
fn observe_model<T>(shared: &SessionShared, result: Result<T, LlmError>, started: Instant) -> Result<T, LlmError> {
    if let Err(e) = &result {
        let latency = started.elapsed();
        shared.core.degradation.observe(match e {
            LlmError::Timeout => RequestOutcome::timeout(latency),
            _ => RequestOutcome::failure(latency),
        });
    }
    result
}
