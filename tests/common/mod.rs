//! Shared fixtures for the session scenario tests: scripted ASR and LLM
//! backends, a session harness over an in-memory outbound channel and
//! synthetic speech.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use vocalis::core::asr::{AsrMode, AsrResult, Recognition, SpeechRecognizer};
use vocalis::core::codec::{CodecTag, samples_to_bytes};
use vocalis::core::dialogue::{DialogueTurn, Role, ToolCallRequest};
use vocalis::core::llm::{FunctionSpec, LanguageModel, LlmChunk, LlmError, LlmResult, LlmStream};
use vocalis::core::providers::EchoModel;
use vocalis::core::session::{AudioParams, ClientMessage, Outbound, ServerMessage, TtsState};
use vocalis::{CoreState, DialogueState, ProviderRegistry, SelectedModules, ServerConfig, Session};

/// 60 ms of 16 kHz mono audio
pub const FRAME_SAMPLES: usize = 960;

/// Recognizer returning queued transcripts in order, then empty text.
pub struct ScriptedRecognizer {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedRecognizer {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    fn mode(&self) -> AsrMode {
        AsrMode::Local
    }

    async fn recognize(&self, _pcm: &[i16], _sample_rate: u32) -> AsrResult<Recognition> {
        let text = self.replies.lock().pop_front().unwrap_or_default();
        Ok(Recognition::new(text))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Model that plays scripted rounds first and behaves like the echo model
/// once the script runs out.
#[derive(Default)]
pub struct ScriptedModel {
    rounds: Mutex<VecDeque<Vec<LlmChunk>>>,
    requests: Mutex<Vec<(Vec<DialogueTurn>, Vec<FunctionSpec>)>>,
    /// Requests still to be refused before the script plays
    failures: Mutex<usize>,
    fallback: EchoModel,
}

impl ScriptedModel {
    pub fn new(rounds: Vec<Vec<LlmChunk>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Default::default()
        }
    }

    /// Refuse the next `count` requests with a connection error.
    pub fn failing(self, count: usize) -> Self {
        *self.failures.lock() = count;
        self
    }

    /// Every request seen so far, with the functions offered.
    pub fn requests(&self) -> Vec<(Vec<DialogueTurn>, Vec<FunctionSpec>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, messages: Vec<DialogueTurn>, functions: Vec<FunctionSpec>) -> LlmResult<LlmStream> {
        self.requests.lock().push((messages.clone(), functions.clone()));
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(LlmError::ConnectionFailed("scripted outage".to_string()));
            }
        }
        let scripted = self.rounds.lock().pop_front();
        match scripted {
            Some(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok::<_, LlmError>)).boxed()),
            None => self.fallback.chat(messages, functions).await,
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub fn text(reply: &str) -> Vec<LlmChunk> {
    vec![LlmChunk::Text(reply.to_string())]
}

/// One round requesting `calls` as `(id, name, json arguments)`.
pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Vec<LlmChunk> {
    vec![LlmChunk::ToolCalls(
        calls
            .iter()
            .map(|(id, name, args)| ToolCallRequest::new(*id, *name, *args))
            .collect(),
    )]
}

/// Configuration wired to the scripted backends with unpaced PCM output.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.selected_module = SelectedModules {
        asr: "scripted".to_string(),
        llm: "scripted".to_string(),
        ..Default::default()
    };
    config.audio.output_format = CodecTag::Pcm16;
    config.audio.pace_output = false;
    config.vad.min_silence_ms = 300;
    // keep the scripted model for the dialogue only
    config.transition.llm_fallback = false;
    config
}

pub fn core_state(config: ServerConfig, recognizer: ScriptedRecognizer, model: Arc<ScriptedModel>) -> Arc<CoreState> {
    let providers = ProviderRegistry::with_dev_providers();
    let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(recognizer);
    providers.register_asr("scripted", true, move || Ok(recognizer.clone()));
    let llm: Arc<dyn LanguageModel> = model;
    providers.register_llm("scripted", true, move || Ok(llm.clone()));
    CoreState::new(config, providers).expect("core state")
}

pub struct Harness {
    pub core: Arc<CoreState>,
    pub session: Arc<Session>,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Everything received so far, in order
    pub seen: Vec<Outbound>,
}

impl Harness {
    pub async fn start(config: ServerConfig, recognizer: ScriptedRecognizer, model: Arc<ScriptedModel>) -> Self {
        Self::attach(core_state(config, recognizer, model)).await
    }

    /// Open a session on an existing core, announcing PCM16 input.
    pub async fn attach(core: Arc<CoreState>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let session = Session::start(core.clone(), "test-device", tx).expect("session start");
        let mut harness = Self {
            core,
            session,
            outbound: rx,
            seen: Vec::new(),
        };
        harness
            .session
            .handle_message(ClientMessage::Hello {
                version: Some(3),
                transport: Some("websocket".to_string()),
                audio_params: Some(AudioParams {
                    format: "pcm16".to_string(),
                    ..Default::default()
                }),
                features: None,
            })
            .await
            .expect("hello");
        harness
            .wait_for(Duration::from_secs(2), |o| {
                matches!(o, Outbound::Message(ServerMessage::Hello { .. }))
            })
            .await;
        harness
    }

    /// Stream one utterance: loud frames then enough silence to end it.
    pub async fn speak(&self) {
        let loud: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| if i % 2 == 0 { 12000 } else { -12000 })
            .collect();
        let silence = vec![0i16; FRAME_SAMPLES];
        for _ in 0..6 {
            self.session
                .push_audio(Bytes::from(samples_to_bytes(&loud)))
                .await
                .expect("audio accepted");
        }
        for _ in 0..8 {
            self.session
                .push_audio(Bytes::from(samples_to_bytes(&silence)))
                .await
                .expect("audio accepted");
        }
    }

    /// Receive until `matches` accepts an item; returns the items received
    /// during this call. Panics on timeout.
    pub async fn wait_for<F>(&mut self, within: Duration, matches: F) -> Vec<Outbound>
    where
        F: Fn(&Outbound) -> bool,
    {
        let mut received = Vec::new();
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let item = tokio::time::timeout_at(deadline, self.outbound.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; received so far: {:?}", summarize(&received)))
                .expect("outbound channel closed");
            let done = matches(&item);
            self.seen.push(item.clone());
            received.push(item);
            if done {
                return received;
            }
        }
    }

    /// Drain whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut received = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            self.seen.push(item.clone());
            received.push(item);
        }
        received
    }

    pub async fn wait_state(&self, state: DialogueState, within: Duration) {
        let mut rx = self.session.state_machine().subscribe();
        tokio::time::timeout(within, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("state {} not reached, still {}", state, self.session.state()))
            .expect("state channel closed");
    }

    /// Wait until the committed history holds at least `len` turns.
    pub async fn wait_history(&self, len: usize, within: Duration) -> Vec<DialogueTurn> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let history = self.session.history();
            if history.len() >= len {
                return history;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("history has {} turns, wanted {}: {:?}", history.len(), len, history);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn roles(&self) -> Vec<Role> {
        self.session.history().iter().map(|t| t.role).collect()
    }
}

pub fn is_tts(item: &Outbound, wanted: TtsState) -> bool {
    matches!(item, Outbound::Message(ServerMessage::Tts { state, .. }) if *state == wanted)
}

pub fn is_audio(item: &Outbound) -> bool {
    matches!(item, Outbound::Audio(_))
}

/// Texts announced with `sentence_start`.
pub fn sentences(items: &[Outbound]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Outbound::Message(ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn count_tts(items: &[Outbound], wanted: TtsState) -> usize {
    items.iter().filter(|item| is_tts(item, wanted)).count()
}

fn summarize(items: &[Outbound]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            Outbound::Audio(data) => format!("audio({})", data.len()),
            Outbound::Message(message) => serde_json::to_string(message).unwrap_or_default(),
            Outbound::Close => "close".to_string(),
        })
        .collect()
}
