//! # Session
//!
//! One [`Session`] per device connection. It owns every pipeline component
//! and runs them as a supervised task set:
//!
//! ```text
//! push_audio → [ingress] → [listen] → [dialogue] → TtsSession → queue → [egress] → Outbound
//!                              ↘ interruption ↗
//! ```
//!
//! Stages are connected by bounded channels. The session stop token cascades
//! to every task; each turn runs under a child token that interruptions cancel.

mod device;
mod dialogue;
mod egress;
mod listen;
pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::asr::AsrSession;
use crate::core::codec::{CodecAdapter, CodecError, CodecTag, PIPELINE_SAMPLE_RATE, create_decoder};
use crate::core::dialogue::{DialogueHistory, DialogueState, DialogueStateMachine, DialogueTurn};
use crate::core::ingress::{AudioIngress, VadGate};
use crate::core::interruption::{
    InterruptionController, InterruptionEvent, InterruptionKind, InterruptionStats, ListenMode,
};
use crate::core::llm::LanguageModel;
use crate::core::memory::Memory;
use crate::core::observability::{Feature, Phase};
use crate::core::orchestrator::{LlmCompiler, ParallelExecutor, Planner};
use crate::core::providers::ProviderError;
use crate::core::state::CoreState;
use crate::core::tools::{
    DeviceChannel, DeviceMcpTransport, IotExecutor, McpExecutor, SecurityEvent, SecurityGuard, ToolCategory,
    ToolContext, ToolRegistry,
};
use crate::core::tts::{AudioPriority, AudioPriorityQueue, TtsObservers, TtsSession, TtsSessionConfig};
use crate::core::types::{SessionClock, SessionId};

use device::{SessionConfirmer, SessionDevice};
use listen::IngressCommand;
pub use protocol::{AudioParams, ClientMessage, ListenState, Outbound, ServerMessage, TtsState};

/// Capacity of the channels between pipeline stages
const STAGE_CHANNEL_CAPACITY: usize = 16;
/// Bound on waiting for tasks at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// Idle check period
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
/// Longest wait for an acknowledgement to finish playing
const ACK_PLAYBACK_LIMIT: Duration = Duration::from_secs(3);
/// Replies to device MCP requests
const MCP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long IoT commands wait for a state report
const IOT_STATE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Provider unavailable: {0}")]
    Provider(#[from] ProviderError),
    #[error("Audio codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudio(String),
    #[error("Session is closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Why output is being cut off.
#[derive(Debug, Clone)]
pub(crate) struct Interrupt {
    pub kind: InterruptionKind,
    pub trigger: String,
    /// Text to run as the next user turn
    pub requeue: Option<String>,
    pub acknowledge: bool,
}

/// State shared by the session's tasks.
pub(crate) struct SessionShared {
    pub id: SessionId,
    pub device_id: String,
    pub core: Arc<CoreState>,
    pub clock: SessionClock,
    pub state: DialogueStateMachine,
    pub interruption: InterruptionController,
    pub tts: TtsSession,
    pub queue: Arc<AudioPriorityQueue>,
    pub outbound: mpsc::Sender<Outbound>,
    pub llm: Arc<dyn LanguageModel>,
    pub memory: Arc<dyn Memory>,
    pub tools: Arc<ToolRegistry>,
    pub compiler: LlmCompiler,
    pub iot: Arc<IotExecutor>,
    pub mcp_transport: Arc<DeviceMcpTransport>,
    pub mcp: Arc<McpExecutor>,
    pub device: Arc<SessionDevice>,
    pub confirmer: Arc<SessionConfirmer>,
    pub stop: CancellationToken,
    pub turn_cancel: Mutex<CancellationToken>,
    pub last_activity: Mutex<Instant>,
    pub listen_mode: Mutex<ListenMode>,
    pub pending_confirmation: Mutex<Option<oneshot::Sender<String>>>,
    /// Written by the dialogue task between turns only
    pub history: Mutex<DialogueHistory>,
    /// Highest sentence id whose LAST marker egress has handled
    pub played: watch::Sender<u64>,
    /// When the user's utterance ended, for TTFR
    pub turn_started: Mutex<Option<Instant>>,
    /// Keeps the FIRST..LAST messages of one sentence contiguous
    pub speech: tokio::sync::Mutex<()>,
    pub dialogue_tx: mpsc::Sender<String>,
    pub ingress_tx: mpsc::Sender<IngressCommand>,
}

impl SessionShared {
    pub async fn send(&self, message: ServerMessage) {
        if self.outbound.send(Outbound::Message(message)).await.is_err() {
            debug!(session_id = %self.id, "Outbound channel closed");
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.lock()
    }

    pub fn tool_context(&self) -> ToolContext {
        let device = Arc::downgrade(&self.device);
        let device: std::sync::Weak<dyn DeviceChannel> = device;
        ToolContext::new(self.id, self.device_id.clone(), device).with_confirmer(self.confirmer.clone())
    }

    /// Move from one of `from` to `to` when the machine allows it. A refused
    /// move leaves the state as it is.
    pub fn settle(&self, from: &[DialogueState], to: DialogueState, reason: &'static str) {
        if let Err(e) = self.state.transition_from(from, to, reason) {
            debug!(session_id = %self.id, "Skipped {} transition: {}", reason, e);
        }
    }

    /// Start a new turn token, cancelling nothing.
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.stop.child_token();
        *self.turn_cancel.lock() = token.clone();
        token
    }

    /// Speak one complete sentence. Returns its sentence id.
    pub async fn say(&self, text: &str, priority: AudioPriority) -> Option<u64> {
        let priority = if self.core.flags.is_enabled(Feature::PriorityQueue) {
            priority
        } else {
            AudioPriority::Normal
        };
        let _speech = self.speech.lock().await;
        match self.tts.speak(text, priority).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(session_id = %self.id, "Failed to queue speech: {}", e);
                None
            }
        }
    }

    /// Wait until egress handled the LAST marker of `sentence_id`.
    pub async fn wait_played(&self, sentence_id: u64, limit: Duration) -> bool {
        let mut rx = self.played.subscribe();
        matches!(
            tokio::time::timeout(limit, rx.wait_for(|played| *played >= sentence_id)).await,
            Ok(Ok(_))
        )
    }

    /// Hand user text to the dialogue task.
    pub async fn submit_user_text(&self, text: String) {
        *self.turn_started.lock() = Some(Instant::now());
        if self.dialogue_tx.send(text).await.is_err() {
            debug!(session_id = %self.id, "Dialogue task gone, dropping user text");
        }
    }

    /// Cut off all output in progress. Returns false when nothing was playing.
    pub async fn interrupt(self: &Arc<Self>, interrupt: Interrupt) -> bool {
        let detected = Instant::now();
        let entered = self.state.atomically(|sm| {
            if sm.current().is_active_output() {
                sm.transition(DialogueState::Interrupted, "barge_in").is_ok()
            } else {
                false
            }
        });
        if !entered {
            return false;
        }

        self.turn_cancel.lock().cancel();
        self.pending_confirmation.lock().take();
        let cleared = self.queue.clear_by_priority(AudioPriority::Transition);
        let generation = self.tts.abort();
        self.send(ServerMessage::tts(self.id, TtsState::Stop, None)).await;

        let latency = detected.elapsed();
        self.core.tracer.record(self.id, Phase::Interruption, latency);
        self.interruption.record(InterruptionEvent {
            kind: interrupt.kind,
            trigger_text: interrupt.trigger.clone(),
            timestamp_ms: self.clock.now_ms(),
            response_latency_ms: Some(latency.as_millis() as u64),
            handled: true,
        });
        info!(
            session_id = %self.id,
            "Interrupted ({:?}) by '{}': {} queued items cleared, generation {}",
            interrupt.kind,
            interrupt.trigger,
            cleared,
            generation
        );

        let ack = match interrupt.acknowledge {
            true => self.interruption.acknowledgement(interrupt.kind),
            false => None,
        };
        let ack_sentence = match ack {
            Some(text) => self.say(text, AudioPriority::Transition).await,
            None => None,
        };

        if let Some(text) = interrupt.requeue {
            self.submit_user_text(text).await;
            return true;
        }

        match ack_sentence {
            Some(sentence_id) => {
                let shared = self.clone();
                tokio::spawn(async move {
                    shared.wait_played(sentence_id, ACK_PLAYBACK_LIMIT).await;
                    shared.settle(&[DialogueState::Interrupted], DialogueState::Idle, "interruption_handled");
                });
            }
            None => self.settle(&[DialogueState::Interrupted], DialogueState::Idle, "interruption_handled"),
        }
        true
    }

    /// Ask the connection to close and stop every task.
    pub async fn request_close(&self, reason: &str) {
        if self.stop.is_cancelled() {
            return;
        }
        info!(session_id = %self.id, "Closing session: {}", reason);
        let _ = self.outbound.send(Outbound::Close).await;
        self.stop.cancel();
    }

    async fn register_mcp_tools(self: Arc<Self>) {
        let ctx = self.tool_context();
        match self.mcp.refresh(&ctx).await {
            Ok(names) => {
                info!(session_id = %self.id, "Device offers {} MCP tools", names.len());
                self.tools.guard().register_dynamic(names);
            }
            Err(e) => warn!(session_id = %self.id, "Device MCP unavailable: {}", e),
        }
    }
}

/// Handle to a running session.
pub struct Session {
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Build the session's components and start its tasks.
    pub fn start(
        core: Arc<CoreState>,
        device_id: impl Into<String>,
        outbound: mpsc::Sender<Outbound>,
    ) -> SessionResult<Arc<Self>> {
        let id = SessionId::new();
        let device_id = device_id.into();
        let config = core.config.clone();
        let providers = core.providers.build_session_set(&config.selected_module)?;
        let clock = SessionClock::new();

        let inbound = inbound_default();
        let ingress = AudioIngress::new(
            id,
            config.audio.framing,
            config.audio.reorder_depth,
            create_decoder(inbound, PIPELINE_SAMPLE_RATE, 1)?,
            providers.vad,
            VadGate::new(config.gate_config(), id, clock, PIPELINE_SAMPLE_RATE),
            core.pool.clone(),
        );
        let asr = AsrSession::new(id, clock, providers.asr, PIPELINE_SAMPLE_RATE, config.vad.min_silence_ms)
            .with_degradation(core.degradation.clone());

        let queue = Arc::new(AudioPriorityQueue::new());
        let codec = CodecAdapter::for_output(config.audio.output_format, config.audio.output_sample_rate)?;
        let tts = TtsSession::spawn(
            id,
            providers.tts,
            codec,
            core.pool.clone(),
            queue.clone(),
            TtsSessionConfig::default(),
            TtsObservers {
                tracer: Some(core.tracer.clone()),
                degradation: Some(core.degradation.clone()),
            },
        );

        let guard = Arc::new(SecurityGuard::new(config.security.clone()));
        let tools = Arc::new(ToolRegistry::new(guard));
        let iot = Arc::new(IotExecutor::new(IOT_STATE_WAIT));
        let mcp_transport = Arc::new(DeviceMcpTransport::new(MCP_TIMEOUT));
        let mcp = Arc::new(McpExecutor::new(ToolCategory::DeviceMcp, mcp_transport.clone()));
        tools.add_executor(core.plugins.clone());
        tools.add_executor(iot.clone());
        tools.add_executor(mcp.clone());

        let executor = ParallelExecutor::new(tools.clone(), config.orchestrator.clone())
            .with_degradation(core.degradation.clone());
        let compiler = LlmCompiler::new(Planner::new(core.transitions.clone()), executor, core.flags.clone())
            .with_tracer(core.tracer.clone());

        let (ingress_tx, ingress_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (dialogue_tx, dialogue_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (played, _) = watch::channel(0u64);
        let stop = CancellationToken::new();

        let shared = Arc::new_cyclic(|weak| SessionShared {
            id,
            device_id,
            clock,
            state: DialogueStateMachine::new(id),
            interruption: InterruptionController::new(config.interruption),
            tts,
            queue,
            device: Arc::new(SessionDevice::new(id, outbound.clone())),
            confirmer: Arc::new(SessionConfirmer::new(weak.clone())),
            outbound,
            llm: providers.llm,
            memory: providers.memory,
            tools,
            compiler,
            iot,
            mcp_transport,
            mcp,
            turn_cancel: Mutex::new(stop.child_token()),
            stop,
            last_activity: Mutex::new(Instant::now()),
            listen_mode: Mutex::new(ListenMode::Auto),
            pending_confirmation: Mutex::new(None),
            history: Mutex::new(DialogueHistory::with_system_prompt(
                config.session.history_token_budget,
                &config.session.system_prompt,
            )),
            played,
            turn_started: Mutex::new(None),
            speech: tokio::sync::Mutex::new(()),
            dialogue_tx,
            ingress_tx,
            core,
        });

        let tasks = vec![
            tokio::spawn(listen::ingress_task(shared.clone(), ingress, ingress_rx, events_tx)),
            tokio::spawn(listen::listen_task(shared.clone(), asr, events_rx)),
            tokio::spawn(dialogue::dialogue_task(shared.clone(), dialogue_rx)),
            tokio::spawn(egress::egress_task(shared.clone())),
            tokio::spawn(idle_monitor(shared.clone())),
        ];
        info!(session_id = %id, "Session started for device '{}'", shared.device_id);

        Ok(Arc::new(Self {
            shared,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn state(&self) -> DialogueState {
        self.shared.state.current()
    }

    pub fn state_machine(&self) -> &DialogueStateMachine {
        &self.shared.state
    }

    pub fn history(&self) -> Vec<DialogueTurn> {
        self.shared.history.lock().snapshot()
    }

    pub fn interruption_stats(&self) -> InterruptionStats {
        self.shared.interruption.stats()
    }

    pub fn interruption_events(&self) -> Vec<InterruptionEvent> {
        self.shared.interruption.recent_events()
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.shared.tools.guard().audit_log()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.shared.tools
    }

    pub fn queue(&self) -> &Arc<AudioPriorityQueue> {
        &self.shared.queue
    }

    /// Cancelled once the session has stopped.
    pub fn stopped(&self) -> CancellationToken {
        self.shared.stop.clone()
    }

    /// Feed one binary audio message.
    pub async fn push_audio(&self, data: Bytes) -> SessionResult<()> {
        self.shared
            .ingress_tx
            .send(IngressCommand::Audio(data))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Run user text as a turn, as if it had been spoken.
    pub async fn inject_text(&self, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.shared.touch();
        self.shared.submit_user_text(text).await;
    }

    /// Client-requested abort: stop output without acknowledgement.
    pub async fn abort(&self, reason: &str) -> bool {
        self.shared
            .interrupt(Interrupt {
                kind: InterruptionKind::Explicit,
                trigger: reason.to_string(),
                requeue: None,
                acknowledge: false,
            })
            .await
    }

    /// Apply one control message from the device.
    pub async fn handle_message(&self, message: ClientMessage) -> SessionResult<()> {
        let shared = &self.shared;
        match message {
            ClientMessage::Hello {
                audio_params, features, ..
            } => {
                if let Some(params) = audio_params.as_ref() {
                    self.configure_input(params).await?;
                }
                let reply = ServerMessage::Hello {
                    session_id: shared.id,
                    transport: "websocket".to_string(),
                    audio_params: AudioParams {
                        format: shared.core.config.audio.output_format.as_str().to_string(),
                        sample_rate: shared.core.config.audio.output_sample_rate,
                        channels: 1,
                        frame_duration: crate::core::codec::FRAME_DURATION_MS,
                    },
                };
                shared.send(reply).await;
                if features.as_ref().is_some_and(supports_mcp) {
                    tokio::spawn(shared.clone().register_mcp_tools());
                }
            }
            ClientMessage::Listen { state, mode, text, .. } => {
                if let Some(mode) = mode.as_deref() {
                    *shared.listen_mode.lock() = ListenMode::from_str_lossy(mode);
                }
                match state {
                    ListenState::Start => {
                        shared.touch();
                        // push-to-talk means the user wants the floor
                        if shared.listen_mode() == ListenMode::Manual {
                            self.abort("listen_start").await;
                        }
                    }
                    ListenState::Stop => {
                        let _ = shared.ingress_tx.send(IngressCommand::EndUtterance).await;
                    }
                    ListenState::Detect => {
                        if let Some(text) = text {
                            info!(session_id = %shared.id, "Wake word: {}", text);
                            self.inject_text(text).await;
                        }
                    }
                }
            }
            ClientMessage::Abort { reason, .. } => {
                let reason = reason.unwrap_or_else(|| "client_abort".to_string());
                if !self.abort(&reason).await {
                    debug!(session_id = %shared.id, "Abort with nothing playing");
                }
            }
            ClientMessage::Goodbye { .. } => shared.request_close("goodbye").await,
            ClientMessage::Restart { .. } => {
                self.abort("restart").await;
                let config = &shared.core.config.session;
                *shared.history.lock() =
                    DialogueHistory::with_system_prompt(config.history_token_budget, &config.system_prompt);
                let _ = shared.ingress_tx.send(IngressCommand::Reset).await;
                info!(session_id = %shared.id, "Conversation restarted");
            }
            ClientMessage::Iot { descriptors, states } => {
                if let Some(descriptors) = descriptors {
                    let names = shared.iot.register_descriptors(&descriptors);
                    shared.tools.guard().register_dynamic(names);
                }
                if let Some(states) = states {
                    shared.iot.update_states(&states);
                }
            }
            ClientMessage::Mcp { payload } => {
                if !shared.mcp_transport.handle_response(&payload) {
                    debug!(session_id = %shared.id, "Unsolicited MCP message ignored");
                }
            }
        }
        Ok(())
    }

    async fn configure_input(&self, params: &AudioParams) -> SessionResult<()> {
        let codec =
            CodecTag::from_format(&params.format).ok_or_else(|| SessionError::UnsupportedAudio(params.format.clone()))?;
        let rate = match codec {
            // Opus decodes straight to the pipeline rate
            CodecTag::Opus => PIPELINE_SAMPLE_RATE,
            CodecTag::Pcm16 => params.sample_rate,
        };
        if rate != PIPELINE_SAMPLE_RATE {
            return Err(SessionError::UnsupportedAudio(format!(
                "{} at {} Hz (expected {} Hz)",
                params.format, params.sample_rate, PIPELINE_SAMPLE_RATE
            )));
        }
        let decoder = create_decoder(codec, rate, params.channels.max(1))?;
        self.shared
            .ingress_tx
            .send(IngressCommand::Configure(decoder))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Stop all tasks, release the TTS session and save the conversation.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.shared;
        shared.stop.cancel();
        shared.pending_confirmation.lock().take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await.is_err() {
            warn!(session_id = %shared.id, "Session tasks did not stop in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        shared.tts.shutdown(SHUTDOWN_GRACE).await;
        shared.queue.close();

        let history = shared.history.lock().snapshot();
        if let Err(e) = shared.memory.save(&shared.device_id, &history).await {
            warn!(session_id = %shared.id, "Failed to save memory: {}", e);
        }
        info!(
            session_id = %shared.id,
            "Session closed after {:?}: {} turns, {} interruptions",
            shared.clock.elapsed(),
            history.len(),
            shared.interruption.stats().total_interruptions
        );
    }
}

/// Codec assumed for inbound audio until `hello` says otherwise.
fn inbound_default() -> CodecTag {
    crate::config::default_output_format()
}

fn supports_mcp(features: &Value) -> bool {
    match features {
        Value::Array(items) => items.iter().any(|f| f.as_str() == Some("mcp")),
        Value::Object(map) => map.get("mcp").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}

/// Close the session once no voice has been heard for the configured limit.
async fn idle_monitor(shared: Arc<SessionShared>) {
    let limit = Duration::from_secs(shared.core.config.session.idle_limit_secs());
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let idle = shared.last_activity.lock().elapsed();
        if idle > limit && !shared.state.current().is_active_output() {
            warn!(session_id = %shared.id, "No voice for {:?}, closing", idle);
            shared.request_close("idle timeout").await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_supports_mcp() {
        assert!(supports_mcp(&json!(["tts", "mcp"])));
        assert!(supports_mcp(&json!({"mcp": true})));
        assert!(!supports_mcp(&json!(["tts", "asr"])));
        assert!(!supports_mcp(&json!("mcp")));
    }
}
