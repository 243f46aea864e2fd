//! # Audio Ingress
//!
//! Binary frames from the device flow through:
//!
//! ```text
//! raw bytes → parse_frame → ReorderBuffer → decode → VoiceDetector → VadGate
//! ```
//!
//! Decoding and VAD inference are CPU-bound and run on the shared
//! [`WorkerPool`]. Codec and framing errors drop the offending frame only.

mod framing;
mod gate;
mod vad;

pub use framing::{
    DEFAULT_REORDER_DEPTH, FRAME_HEADER_LEN, FramedPacket, FramingError, FramingMode, MAX_REORDER_DEPTH,
    ReorderBuffer, encode_frame, parse_frame,
};
pub use gate::{GateOutput, SpeechSegment, VadEvent, VadEventKind, VadGate, VadGateConfig};
pub use vad::{EnergyVoiceDetector, VoiceDetector};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::codec::AudioDecoder;
use crate::core::types::SessionId;
use crate::core::worker_pool::WorkerPool;

/// Output of the ingress stage.
#[derive(Debug)]
pub enum IngressEvent {
    Vad(VadEvent),
    /// PCM belonging to an utterance in progress, for streaming ASR
    Speech(Vec<i16>),
    Segment(SpeechSegment),
}

/// Decoder and detector travel together onto the worker pool.
struct DspState {
    decoder: Box<dyn AudioDecoder>,
    detector: Box<dyn VoiceDetector>,
}

pub struct AudioIngress {
    session_id: SessionId,
    framing: FramingMode,
    reorder: ReorderBuffer,
    dsp: Option<DspState>,
    gate: VadGate,
    pool: WorkerPool,
    codec_errors: u64,
}

impl AudioIngress {
    pub fn new(
        session_id: SessionId,
        framing: FramingMode,
        reorder_depth: usize,
        decoder: Box<dyn AudioDecoder>,
        detector: Box<dyn VoiceDetector>,
        gate: VadGate,
        pool: WorkerPool,
    ) -> Self {
        Self {
            session_id,
            framing,
            reorder: ReorderBuffer::new(reorder_depth),
            dsp: Some(DspState { decoder, detector }),
            gate,
            pool,
            codec_errors: 0,
        }
    }

    pub fn codec_errors(&self) -> u64 {
        self.codec_errors
    }

    pub fn dropped_packets(&self) -> u64 {
        self.reorder.dropped()
    }

    pub fn is_speaking(&self) -> bool {
        self.gate.is_speaking()
    }

    /// Handle one binary websocket message.
    pub async fn process(&mut self, data: Bytes) -> Vec<IngressEvent> {
        let packet = match parse_frame(data, self.framing) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(session_id = %self.session_id, "Dropping audio frame: {}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for payload in self.reorder.push(packet) {
            self.process_payload(payload, &mut events).await;
        }
        events
    }

    /// Release buffered packets, e.g. on `listen stop`.
    pub async fn flush(&mut self) -> Vec<IngressEvent> {
        let mut events = Vec::new();
        for payload in self.reorder.flush() {
            self.process_payload(payload, &mut events).await;
        }
        events
    }

    /// End the current utterance regardless of VAD.
    pub fn force_end(&mut self) -> Vec<IngressEvent> {
        match self.gate.force_end() {
            Some((event, segment)) => vec![IngressEvent::Vad(event), IngressEvent::Segment(segment)],
            None => Vec::new(),
        }
    }

    /// Swap the decoder after the client announced its audio format.
    pub fn set_decoder(&mut self, decoder: Box<dyn AudioDecoder>) {
        if let Some(dsp) = self.dsp.as_mut() {
            dsp.decoder = decoder;
        }
    }

    pub fn reset(&mut self) {
        self.gate.reset();
        if let Some(dsp) = self.dsp.as_mut() {
            dsp.detector.reset();
        }
    }

    async fn process_payload(&mut self, payload: Bytes, events: &mut Vec<IngressEvent>) {
        let Some(mut dsp) = self.dsp.take() else {
            return;
        };

        let job = self
            .pool
            .run(move || {
                let result = dsp.decoder.decode(&payload).map(|pcm| {
                    let probability = dsp.detector.speech_probability(&pcm);
                    (pcm, probability)
                });
                (dsp, result)
            })
            .await;

        let (dsp, result) = match job {
            Ok(done) => done,
            Err(e) => {
                // The decoder is lost with the panicked job; audio is ignored from now on
                warn!(session_id = %self.session_id, "Audio decode job failed: {}", e);
                return;
            }
        };
        self.dsp = Some(dsp);

        let (pcm, probability) = match result {
            Ok(decoded) => decoded,
            Err(e) => {
                self.codec_errors += 1;
                debug!(session_id = %self.session_id, "Skipping malformed audio frame: {}", e);
                return;
            }
        };

        let output = self.gate.push(pcm, probability);
        events.extend(output.events.into_iter().map(IngressEvent::Vad));
        if let Some(pcm) = output.speech_pcm {
            events.push(IngressEvent::Speech(pcm));
        }
        if let Some(segment) = output.segment {
            events.push(IngressEvent::Segment(segment));
        }
    }
}
