use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Error types for ASR operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum AsrError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),
    #[error("Recognition timed out after {0}ms")]
    Timeout(u64),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type AsrResult<T> = Result<T, AsrError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// One recognition result handed to the dialogue loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub confidence: Option<f32>,
    pub timestamp_ms: u64,
    /// Set when recognition failed; `text` is then empty
    pub error: Option<String>,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            kind: TranscriptKind::Partial,
            text: text.into(),
            confidence: None,
            timestamp_ms,
            error: None,
        }
    }

    pub fn final_text(text: impl Into<String>, confidence: Option<f32>, timestamp_ms: u64) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
            confidence: confidence.map(|c| c.clamp(0.0, 1.0)),
            timestamp_ms,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: String::new(),
            confidence: None,
            timestamp_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Raw recognizer output before it is stamped with session time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: Option<f32>,
}

impl Recognition {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// How a recognizer is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrMode {
    /// Whole segment in, transcript out; the instance may be shared
    Local,
    /// Dedicated per-session stream fed while the user speaks
    RemoteStreaming,
}

/// A speech recognizer backend.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn mode(&self) -> AsrMode;

    /// Recognize a complete utterance.
    async fn recognize(&self, pcm: &[i16], sample_rate: u32) -> AsrResult<Recognition>;

    /// Open a streaming channel. Partial results are sent on `partials`.
    async fn open_stream(
        &self,
        sample_rate: u32,
        partials: mpsc::Sender<Recognition>,
    ) -> AsrResult<Box<dyn AsrStream>> {
        let _ = (sample_rate, partials);
        Err(AsrError::Unsupported(format!(
            "{} does not support streaming",
            self.name()
        )))
    }

    fn name(&self) -> &'static str;
}

/// Live recognition stream for one utterance.
#[async_trait]
pub trait AsrStream: Send + Sync {
    async fn push(&mut self, pcm: &[i16]) -> AsrResult<()>;

    /// Close the audio side and wait for the final transcript.
    async fn finish(self: Box<Self>) -> AsrResult<Recognition>;
}
