//! Opus codec backed by libopus.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;

use super::{AudioDecoder, AudioEncoder, CodecError, CodecResult, CodecTag, FRAME_DURATION_MS};

/// Upper bound of one Opus packet as recommended by libopus.
const MAX_PACKET_BYTES: usize = 4000;

fn opus_sample_rate(sample_rate: u32) -> CodecResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        other => Err(CodecError::Unsupported(format!(
            "Opus does not support {other} Hz"
        ))),
    }
}

fn opus_channels(channels: u16) -> CodecResult<Channels> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(CodecError::Unsupported(format!(
            "Opus does not support {other} channels"
        ))),
    }
}

/// Opus decoder producing mono PCM.
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Scratch buffer sized for the largest frame libopus can emit (120 ms)
    scratch: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> CodecResult<Self> {
        let decoder = Decoder::new(opus_sample_rate(sample_rate)?, opus_channels(channels)?)
            .map_err(|e| CodecError::Unsupported(format!("Failed to create decoder: {e}")))?;
        let max_samples = (sample_rate as usize * 120 / 1000) * channels as usize;
        Ok(Self {
            decoder,
            channels,
            scratch: vec![0; max_samples],
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, payload: &[u8]) -> CodecResult<Vec<i16>> {
        if payload.is_empty() {
            return Err(CodecError::MalformedFrame("empty Opus packet".to_string()));
        }
        let decoded = self
            .decoder
            .decode(Some(payload), &mut self.scratch, false)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        let interleaved = &self.scratch[..decoded * self.channels as usize];
        if self.channels == 1 {
            return Ok(interleaved.to_vec());
        }
        Ok(interleaved
            .chunks_exact(2)
            .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
            .collect())
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Opus
    }
}

/// Mono Opus encoder tuned for speech.
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    packet: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32) -> CodecResult<Self> {
        let encoder = Encoder::new(
            opus_sample_rate(sample_rate)?,
            Channels::Mono,
            Application::Voip,
        )
        .map_err(|e| CodecError::Unsupported(format!("Failed to create encoder: {e}")))?;
        Ok(Self {
            encoder,
            sample_rate,
            packet: vec![0; MAX_PACKET_BYTES],
        })
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode_frame(&mut self, pcm: &[i16]) -> CodecResult<Bytes> {
        let expected = (self.sample_rate * FRAME_DURATION_MS / 1000) as usize;
        if pcm.len() != expected {
            return Err(CodecError::Encoder(format!(
                "Opus frame must hold {expected} samples, got {}",
                pcm.len()
            )));
        }
        let written = self
            .encoder
            .encode(pcm, &mut self.packet)
            .map_err(|e| CodecError::Encoder(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&self.packet[..written]))
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Opus
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
