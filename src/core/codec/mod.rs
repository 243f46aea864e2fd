//! # Audio Codec Adapter
//!
//! Decodes inbound device audio to 16-bit PCM and encodes outbound PCM into
//! fixed 60 ms frames. Two codecs are supported:
//!
//! - **pcm16**: little-endian signed 16-bit samples, always available
//! - **opus**: libopus through `audiopus`, behind the `opus` feature
//!
//! When the `opus` feature is disabled a stub is compiled in that rejects
//! every Opus operation with [`CodecError::Unsupported`].
//!
//! Malformed inbound frames surface as [`CodecError::MalformedFrame`]; callers
//! drop the frame and keep the session alive.

mod adapter;
#[cfg(feature = "opus")]
mod opus;
mod pcm;
mod resample;
#[cfg(not(feature = "opus"))]
mod stub;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use adapter::CodecAdapter;
#[cfg(feature = "opus")]
pub use opus::{OpusDecoder, OpusEncoder};
pub use pcm::{Pcm16Decoder, Pcm16Encoder};
pub use resample::PcmResampler;
#[cfg(not(feature = "opus"))]
pub use stub::{OpusDecoder, OpusEncoder};

/// Outbound frame duration in milliseconds.
pub const FRAME_DURATION_MS: u32 = 60;

/// Sample rate the ingress pipeline works in.
pub const PIPELINE_SAMPLE_RATE: u32 = 16000;

/// Codec tag carried by every [`AudioFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecTag {
    Opus,
    Pcm16,
}

impl CodecTag {
    /// Parse the `format` field of the client's `audio_params`.
    pub fn from_format(format: &str) -> Option<Self> {
        match format.to_ascii_lowercase().as_str() {
            "opus" => Some(Self::Opus),
            "pcm" | "pcm16" | "linear16" => Some(Self::Pcm16),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Pcm16 => "pcm16",
        }
    }
}

/// Immutable audio buffer owned by whichever pipeline stage holds it.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub codec: CodecTag,
    pub sample_rate: u32,
    pub channels: u16,
    /// Presentation-time hint in monotonic milliseconds
    pub pts_ms: Option<u64>,
}

impl AudioFrame {
    pub fn new(data: Bytes, codec: CodecTag, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            codec,
            sample_rate,
            channels,
            pts_ms: None,
        }
    }

    pub fn with_pts(mut self, pts_ms: u64) -> Self {
        self.pts_ms = Some(pts_ms);
        self
    }
}

/// Codec error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed audio frame: {0}")]
    MalformedFrame(String),
    #[error("Unsupported codec configuration: {0}")]
    Unsupported(String),
    #[error("Encoder error: {0}")]
    Encoder(String),
    #[error("Resampler error: {0}")]
    Resample(String),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Turns one inbound payload into PCM samples.
pub trait AudioDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> CodecResult<Vec<i16>>;

    fn codec(&self) -> CodecTag;
}

/// Encodes exactly one frame of PCM samples.
pub trait AudioEncoder: Send {
    fn encode_frame(&mut self, pcm: &[i16]) -> CodecResult<Bytes>;

    fn codec(&self) -> CodecTag;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16 {
        1
    }

    /// Samples per channel in one outbound frame.
    fn frame_samples(&self) -> usize {
        (self.sample_rate() * FRAME_DURATION_MS / 1000) as usize
    }
}

/// Build a decoder for the inbound format announced by the client.
pub fn create_decoder(
    codec: CodecTag,
    sample_rate: u32,
    channels: u16,
) -> CodecResult<Box<dyn AudioDecoder>> {
    match codec {
        CodecTag::Pcm16 => Ok(Box::new(Pcm16Decoder::new(channels))),
        CodecTag::Opus => Ok(Box::new(OpusDecoder::new(sample_rate, channels)?)),
    }
}

/// Build an encoder for the outbound format.
pub fn create_encoder(codec: CodecTag, sample_rate: u32) -> CodecResult<Box<dyn AudioEncoder>> {
    match codec {
        CodecTag::Pcm16 => Ok(Box::new(Pcm16Encoder::new(sample_rate))),
        CodecTag::Opus => Ok(Box::new(OpusEncoder::new(sample_rate)?)),
    }
}

/// Convert little-endian PCM16 bytes to samples. A trailing odd byte is an error.
pub fn bytes_to_samples(bytes: &[u8]) -> CodecResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Convert samples to little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_tag_from_format() {
        assert_eq!(CodecTag::from_format("opus"), Some(CodecTag::Opus));
        assert_eq!(CodecTag::from_format("PCM"), Some(CodecTag::Pcm16));
        assert_eq!(CodecTag::from_format("linear16"), Some(CodecTag::Pcm16));
        assert_eq!(CodecTag::from_format("mp3"), None);
    }

    #[test]
    fn test_odd_pcm_payload_is_malformed() {
        let result = bytes_to_samples(&[1, 2, 3]);
        assert!(matches!(result, Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn test_pcm_bytes_conversion() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes_to_samples(&bytes).unwrap(), samples);
    }

    #[test]
    fn test_frame_samples_at_16k() {
        let encoder = Pcm16Encoder::new(16000);
        assert_eq!(encoder.frame_samples(), 960);
    }
}
