//! # TTS Provider Interface
//!
//! Backends come in three shapes, declared through [`TtsMode`]:
//!
//! - **NonStream**: `synthesize(text)` returns the whole utterance as PCM16
//! - **SingleStream**: `synthesize_stream(text)` yields PCM16 chunks as they
//!   are produced
//! - **DualStream**: `open_duplex` returns a bidirectional channel; text is
//!   streamed in, audio streams out, `flush` forces generation of buffered
//!   text and `stop` is reserved for interruption
//!
//! All audio handed to the session is little-endian PCM16 mono at
//! [`TextToSpeech::sample_rate`]. Encoding to the device codec happens in the
//! session.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// TTS-specific error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Audio generation failed: {0}")]
    AudioGenerationFailed(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Synthesis aborted")]
    Aborted,
}

/// Result type for TTS operations
pub type TtsResult<T> = Result<T, TtsError>;

pub type PcmStream = BoxStream<'static, TtsResult<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsMode {
    NonStream,
    SingleStream,
    DualStream,
}

/// Parameters sent with the duplex `start` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplexParams {
    pub voice: Option<String>,
    pub sample_rate: u32,
    pub format: &'static str,
}

/// Events produced by a duplex channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DuplexEvent {
    Audio(Bytes),
    /// Provider finished everything sent before the last `flush`
    Finished,
    Error(String),
}

/// Write half of a duplex synthesis channel.
#[async_trait]
pub trait DuplexControl: Send + Sync {
    async fn send_text(&mut self, text: &str) -> TtsResult<()>;

    async fn flush(&mut self) -> TtsResult<()>;

    /// Stop generation and close the channel. Only used on interruption.
    async fn stop(&mut self) -> TtsResult<()>;
}

pub struct DuplexHandle {
    pub control: Box<dyn DuplexControl>,
    pub events: mpsc::Receiver<DuplexEvent>,
}

/// Base trait for Text-to-Speech providers
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn mode(&self) -> TtsMode;

    /// Sample rate of the PCM16 this provider produces.
    fn sample_rate(&self) -> u32;

    /// Whole-utterance synthesis.
    async fn synthesize(&self, text: &str) -> TtsResult<Bytes>;

    /// Chunked synthesis. Defaults to one chunk from [`synthesize`](Self::synthesize).
    async fn synthesize_stream(&self, text: &str) -> TtsResult<PcmStream> {
        let pcm = self.synthesize(text).await?;
        Ok(stream::iter(vec![Ok(pcm)]).boxed())
    }

    /// Open a bidirectional channel. Only dual-stream providers support this.
    async fn open_duplex(&self, _params: DuplexParams) -> TtsResult<DuplexHandle> {
        Err(TtsError::Unsupported(format!(
            "{} does not support duplex synthesis",
            self.name()
        )))
    }

    fn name(&self) -> &'static str;
}
