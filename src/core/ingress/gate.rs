//! Voice activity gate: turns per-chunk probabilities into speech segments.
//!
//! # State Transitions
//!
//! ```text
//! [Listening] ── ≥ voiced_frames of last window_size voiced ──► [Speaking]  (voice_start)
//!     │                                                              │
//!     └── idle > idle_timeout ──► silence_timeout (once)             │
//!                                                                    │
//! [Speaking] ── voiced ──► voice_continue                            │
//!     └── silence ≥ min_silence ──► [Listening]  (voice_end + segment)
//! ```
//!
//! A frame counts as voiced when its probability reaches `threshold_high`,
//! or `threshold_low` while already speaking.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::{SessionClock, SessionId};

/// Gate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadGateConfig {
    pub threshold_high: f32,
    pub threshold_low: f32,
    /// Sliding window length in frames
    pub window_size: usize,
    /// Voiced frames within the window required for voice_start
    pub voiced_frames: usize,
    pub min_silence_ms: u64,
    /// Idle time without speech before silence_timeout fires
    pub idle_timeout_ms: u64,
}

impl Default for VadGateConfig {
    fn default() -> Self {
        Self {
            threshold_high: 0.5,
            threshold_low: 0.2,
            window_size: 5,
            voiced_frames: 3,
            min_silence_ms: 1000,
            idle_timeout_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEventKind {
    VoiceStart,
    VoiceContinue,
    VoiceEnd,
    SilenceTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadEvent {
    pub kind: VadEventKind,
    pub session_id: SessionId,
    pub timestamp_ms: u64,
}

/// Ordered PCM frames of one utterance, consumed once by ASR.
#[derive(Debug, Clone, Default)]
pub struct SpeechSegment {
    pub frames: Vec<Vec<i16>>,
    pub sample_rate: u32,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
}

impl SpeechSegment {
    pub fn samples(&self) -> Vec<i16> {
        self.frames.iter().flatten().copied().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.sample_count() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }
}

/// Result of pushing one chunk through the gate.
#[derive(Debug, Default)]
pub struct GateOutput {
    pub events: Vec<VadEvent>,
    /// The chunk itself when it belongs to an utterance in progress
    pub speech_pcm: Option<Vec<i16>>,
    pub segment: Option<SpeechSegment>,
}

pub struct VadGate {
    config: VadGateConfig,
    session_id: SessionId,
    clock: SessionClock,
    sample_rate: u32,
    in_speech: bool,
    window: VecDeque<bool>,
    pre_roll: VecDeque<Vec<i16>>,
    segment: Vec<Vec<i16>>,
    segment_started_ms: u64,
    silence_ms: u64,
    idle_ms: u64,
    timeout_fired: bool,
}

impl VadGate {
    pub fn new(config: VadGateConfig, session_id: SessionId, clock: SessionClock, sample_rate: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            pre_roll: VecDeque::with_capacity(config.window_size),
            config,
            session_id,
            clock,
            sample_rate,
            in_speech: false,
            segment: Vec::new(),
            segment_started_ms: 0,
            silence_ms: 0,
            idle_ms: 0,
            timeout_fired: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.in_speech
    }

    pub fn config(&self) -> &VadGateConfig {
        &self.config
    }

    fn event(&self, kind: VadEventKind) -> VadEvent {
        VadEvent {
            kind,
            session_id: self.session_id,
            timestamp_ms: self.clock.now_ms(),
        }
    }

    fn chunk_duration_ms(&self, samples: usize) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples as u64 * 1000 / self.sample_rate as u64
    }

    /// Feed one decoded chunk with its speech probability.
    pub fn push(&mut self, pcm: Vec<i16>, probability: f32) -> GateOutput {
        let mut output = GateOutput::default();
        let duration = self.chunk_duration_ms(pcm.len());
        let threshold = if self.in_speech {
            self.config.threshold_low
        } else {
            self.config.threshold_high
        };
        let voiced = probability >= threshold;

        if self.window.len() == self.config.window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(voiced);

        if !self.in_speech {
            if self.pre_roll.len() == self.config.window_size.max(1) {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back(pcm);
            self.idle_ms += duration;

            let voiced_count = self.window.iter().filter(|v| **v).count();
            if voiced_count >= self.config.voiced_frames {
                self.in_speech = true;
                self.silence_ms = 0;
                self.idle_ms = 0;
                self.timeout_fired = false;
                self.segment_started_ms = self.clock.now_ms();
                self.segment = self.pre_roll.drain(..).collect();
                debug!(session_id = %self.session_id, "VAD gate: voice start");
                output.events.push(self.event(VadEventKind::VoiceStart));
                output.speech_pcm = Some(self.segment.iter().flatten().copied().collect());
            } else if self.idle_ms > self.config.idle_timeout_ms && !self.timeout_fired {
                self.timeout_fired = true;
                info!(session_id = %self.session_id, "VAD gate: silence timeout after {}ms", self.idle_ms);
                output.events.push(self.event(VadEventKind::SilenceTimeout));
            }
            return output;
        }

        output.speech_pcm = Some(pcm.clone());
        self.segment.push(pcm);
        if voiced {
            self.silence_ms = 0;
            output.events.push(self.event(VadEventKind::VoiceContinue));
        } else {
            self.silence_ms += duration;
            if self.silence_ms >= self.config.min_silence_ms {
                output.segment = Some(self.finish_segment());
                output.events.push(self.event(VadEventKind::VoiceEnd));
            }
        }
        output
    }

    /// End the current utterance immediately (listen stop, manual mode).
    pub fn force_end(&mut self) -> Option<(VadEvent, SpeechSegment)> {
        if !self.in_speech {
            return None;
        }
        let segment = self.finish_segment();
        Some((self.event(VadEventKind::VoiceEnd), segment))
    }

    /// Drop all state, e.g. when the client restarts listening.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.window.clear();
        self.pre_roll.clear();
        self.segment.clear();
        self.silence_ms = 0;
        self.idle_ms = 0;
        self.timeout_fired = false;
    }

    fn finish_segment(&mut self) -> SpeechSegment {
        debug!(
            session_id = %self.session_id,
            "VAD gate: voice end after {}ms silence", self.silence_ms
        );
        self.in_speech = false;
        self.silence_ms = 0;
        self.idle_ms = 0;
        self.window.clear();
        SpeechSegment {
            frames: std::mem::take(&mut self.segment),
            sample_rate: self.sample_rate,
            started_at_ms: self.segment_started_ms,
            ended_at_ms: self.clock.now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(min_silence_ms: u64) -> VadGate {
        let config = VadGateConfig {
            min_silence_ms,
            idle_timeout_ms: 600,
            ..Default::default()
        };
        VadGate::new(config, SessionId::new(), SessionClock::new(), 16000)
    }

    // 60 ms at 16 kHz
    fn chunk() -> Vec<i16> {
        vec![1; 960]
    }

    fn kinds(output: &GateOutput) -> Vec<VadEventKind> {
        output.events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_voice_start_needs_three_of_five() {
        let mut gate = gate(300);
        assert!(gate.push(chunk(), 0.9).events.is_empty());
        assert!(gate.push(chunk(), 0.1).events.is_empty());
        assert!(gate.push(chunk(), 0.9).events.is_empty());
        let out = gate.push(chunk(), 0.9);
        assert_eq!(kinds(&out), vec![VadEventKind::VoiceStart]);
        assert!(gate.is_speaking());
    }

    #[test]
    fn test_low_threshold_applies_while_speaking() {
        let mut gate = gate(120);
        for _ in 0..3 {
            gate.push(chunk(), 0.9);
        }
        // 0.3 is below high but above low: still voiced
        let out = gate.push(chunk(), 0.3);
        assert_eq!(kinds(&out), vec![VadEventKind::VoiceContinue]);
        assert!(gate.is_speaking());
    }

    #[test]
    fn test_voice_end_after_min_silence_returns_segment() {
        let mut gate = gate(120);
        for _ in 0..3 {
            gate.push(chunk(), 0.9);
        }
        assert!(gate.push(chunk(), 0.0).segment.is_none());
        let out = gate.push(chunk(), 0.0);
        assert_eq!(kinds(&out), vec![VadEventKind::VoiceEnd]);
        let segment = out.segment.unwrap();
        // three pre-roll chunks plus two silent chunks
        assert_eq!(segment.frames.len(), 5);
        assert_eq!(segment.duration_ms(), 300);
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_silence_timeout_fires_once() {
        let mut gate = gate(300);
        let mut fired = 0;
        for _ in 0..30 {
            let out = gate.push(chunk(), 0.0);
            fired += out
                .events
                .iter()
                .filter(|e| e.kind == VadEventKind::SilenceTimeout)
                .count();
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_force_end() {
        let mut gate = gate(1000);
        assert!(gate.force_end().is_none());
        for _ in 0..3 {
            gate.push(chunk(), 0.9);
        }
        let (event, segment) = gate.force_end().unwrap();
        assert_eq!(event.kind, VadEventKind::VoiceEnd);
        assert_eq!(segment.frames.len(), 3);
    }
}
