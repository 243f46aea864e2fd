//! Development backends: no network, deterministic output.

use std::f32::consts::PI;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use crate::core::asr::{AsrMode, AsrResult, Recognition, SpeechRecognizer};
use crate::core::codec::{PIPELINE_SAMPLE_RATE, samples_to_bytes};
use crate::core::dialogue::{DialogueTurn, Role};
use crate::core::llm::{FunctionSpec, LanguageModel, LlmChunk, LlmResult, LlmStream};
use crate::core::tts::{TextToSpeech, TtsMode, TtsResult};

/// Recognizer that never hears anything.
pub struct NullRecognizer;

#[async_trait]
impl SpeechRecognizer for NullRecognizer {
    fn mode(&self) -> AsrMode {
        AsrMode::Local
    }

    async fn recognize(&self, _pcm: &[i16], _sample_rate: u32) -> AsrResult<Recognition> {
        Ok(Recognition::new(""))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Repeats the user's words, or the results of the tools it was shown.
pub struct EchoModel {
    fallback: String,
}

impl Default for EchoModel {
    fn default() -> Self {
        Self {
            fallback: "我没有听清楚，请再说一遍。".to_string(),
        }
    }
}

impl EchoModel {
    fn reply_for(&self, messages: &[DialogueTurn]) -> String {
        let tool_results: Vec<&str> = messages
            .iter()
            .rev()
            .take_while(|m| m.role == Role::Tool)
            .map(|m| m.text.as_str())
            .collect();
        if !tool_results.is_empty() {
            return tool_results.into_iter().rev().collect::<Vec<_>>().join("，");
        }
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    async fn chat(&self, messages: Vec<DialogueTurn>, _functions: Vec<FunctionSpec>) -> LlmResult<LlmStream> {
        let reply = self.reply_for(&messages);
        // two deltas so consumers see a real stream
        let split = reply
            .char_indices()
            .nth(reply.chars().count() / 2)
            .map(|(i, _)| i)
            .unwrap_or(reply.len());
        let (head, tail) = reply.split_at(split);
        let chunks: Vec<LlmResult<LlmChunk>> = [head, tail]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| Ok(LlmChunk::Text(s.to_string())))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Non-stream synthesizer producing a sine tone whose length follows the text.
pub struct ToneSynthesizer {
    frequency_hz: f32,
    ms_per_char: u32,
    min_ms: u32,
    max_ms: u32,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            ms_per_char: 120,
            min_ms: 240,
            max_ms: 4000,
        }
    }
}

impl ToneSynthesizer {
    fn render(&self, text: &str) -> Vec<i16> {
        let chars = text.chars().filter(|c| !c.is_whitespace()).count() as u32;
        let ms = (chars * self.ms_per_char).clamp(self.min_ms, self.max_ms);
        let samples = (PIPELINE_SAMPLE_RATE * ms / 1000) as usize;
        (0..samples)
            .map(|n| {
                let t = n as f32 / PIPELINE_SAMPLE_RATE as f32;
                ((2.0 * PI * self.frequency_hz * t).sin() * 8000.0) as i16
            })
            .collect()
    }
}

#[async_trait]
impl TextToSpeech for ToneSynthesizer {
    fn mode(&self) -> TtsMode {
        TtsMode::NonStream
    }

    fn sample_rate(&self) -> u32 {
        PIPELINE_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str) -> TtsResult<Bytes> {
        Ok(Bytes::from(samples_to_bytes(&self.render(text))))
    }

    fn name(&self) -> &'static str {
        "tone"
    }
}
