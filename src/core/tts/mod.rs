//! # Text-to-Speech
//!
//! [`TtsSession`] turns sentence-framed text into encoded audio frames and
//! feeds the [`AudioPriorityQueue`] that egress drains. Providers implement
//! [`TextToSpeech`] in one of three [`TtsMode`]s.

mod base;
mod messages;
mod priority_queue;
mod session;

pub use base::{
    DuplexControl, DuplexEvent, DuplexHandle, DuplexParams, PcmStream, TextToSpeech, TtsError,
    TtsMode, TtsResult,
};
pub use messages::{AudioPriority, ContentType, SentenceType, TtsAudio, TtsMessage, TtsPayload};
pub use priority_queue::{AudioPriorityQueue, QueueError, QueueStats, QueuedAudio};
pub use session::{SentenceWriter, TtsObservers, TtsSession, TtsSessionConfig, TtsStats};
