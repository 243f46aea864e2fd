//! Stub implementation when the `opus` feature is disabled.

use bytes::Bytes;

use super::{AudioDecoder, AudioEncoder, CodecError, CodecResult, CodecTag};

const DISABLED: &str = "Opus support is not compiled in; rebuild with --features opus";

/// Stub Opus decoder. Construction always fails.
pub struct OpusDecoder {
    _private: (),
}

impl OpusDecoder {
    pub fn new(_sample_rate: u32, _channels: u16) -> CodecResult<Self> {
        Err(CodecError::Unsupported(DISABLED.to_string()))
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, _payload: &[u8]) -> CodecResult<Vec<i16>> {
        Err(CodecError::Unsupported(DISABLED.to_string()))
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Opus
    }
}

/// Stub Opus encoder. Construction always fails.
pub struct OpusEncoder {
    sample_rate: u32,
}

impl OpusEncoder {
    pub fn new(_sample_rate: u32) -> CodecResult<Self> {
        Err(CodecError::Unsupported(DISABLED.to_string()))
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode_frame(&mut self, _pcm: &[i16]) -> CodecResult<Bytes> {
        Err(CodecError::Unsupported(DISABLED.to_string()))
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Opus
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
