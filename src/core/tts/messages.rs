//! Messages flowing into and out of the TTS session.

use bytes::Bytes;
use serde::Serialize;

use crate::core::codec::AudioFrame;

/// Sentence lifecycle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SentenceType {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    File,
    Action,
}

/// Payload of a [`TtsMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum TtsPayload {
    None,
    Text(String),
    /// Pre-rendered PCM16 mono audio, played as-is
    Audio { pcm: Bytes, sample_rate: u32 },
}

/// Playback priority; lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AudioPriority {
    Interrupt = 0,
    Transition = 1,
    Backchannel = 2,
    Normal = 3,
    Low = 4,
}

impl AudioPriority {
    pub const ALL: [AudioPriority; 5] = [
        Self::Interrupt,
        Self::Transition,
        Self::Backchannel,
        Self::Normal,
        Self::Low,
    ];

    pub fn as_index(self) -> usize {
        self as usize
    }
}

/// Input to the TTS session.
///
/// All messages of one synthesis turn share a `sentence_id`: exactly one
/// FIRST, any number of MIDDLE, exactly one LAST.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsMessage {
    pub sentence_type: SentenceType,
    pub content_type: ContentType,
    pub payload: TtsPayload,
    pub sentence_id: u64,
    pub priority: AudioPriority,
    /// Abort generation the message was produced under
    pub generation: u64,
}

impl TtsMessage {
    pub fn first(sentence_id: u64, priority: AudioPriority, generation: u64) -> Self {
        Self {
            sentence_type: SentenceType::First,
            content_type: ContentType::Action,
            payload: TtsPayload::None,
            sentence_id,
            priority,
            generation,
        }
    }

    pub fn text(sentence_id: u64, text: impl Into<String>, priority: AudioPriority, generation: u64) -> Self {
        Self {
            sentence_type: SentenceType::Middle,
            content_type: ContentType::Text,
            payload: TtsPayload::Text(text.into()),
            sentence_id,
            priority,
            generation,
        }
    }

    pub fn file(
        sentence_id: u64,
        pcm: Bytes,
        sample_rate: u32,
        priority: AudioPriority,
        generation: u64,
    ) -> Self {
        Self {
            sentence_type: SentenceType::Middle,
            content_type: ContentType::File,
            payload: TtsPayload::Audio { pcm, sample_rate },
            sentence_id,
            priority,
            generation,
        }
    }

    pub fn last(sentence_id: u64, priority: AudioPriority, generation: u64) -> Self {
        Self {
            sentence_type: SentenceType::Last,
            content_type: ContentType::Action,
            payload: TtsPayload::None,
            sentence_id,
            priority,
            generation,
        }
    }
}

/// Output of the TTS session, consumed by egress through the priority queue.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub sentence_type: SentenceType,
    pub sentence_id: u64,
    pub frames: Vec<AudioFrame>,
    /// Text the frames were synthesized from, reported to the client
    pub text: Option<String>,
    pub priority: AudioPriority,
    pub generation: u64,
}

impl TtsAudio {
    pub fn marker(sentence_type: SentenceType, sentence_id: u64, priority: AudioPriority, generation: u64) -> Self {
        Self {
            sentence_type,
            sentence_id,
            frames: Vec::new(),
            text: None,
            priority,
            generation,
        }
    }

    pub fn middle(
        sentence_id: u64,
        frames: Vec<AudioFrame>,
        text: Option<String>,
        priority: AudioPriority,
        generation: u64,
    ) -> Self {
        Self {
            sentence_type: SentenceType::Middle,
            sentence_id,
            frames,
            text,
            priority,
            generation,
        }
    }
}
