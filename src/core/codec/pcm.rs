//! PCM16 passthrough codec.

use bytes::Bytes;

use super::{AudioDecoder, AudioEncoder, CodecResult, CodecTag, bytes_to_samples, samples_to_bytes};

/// Decoder for raw little-endian PCM16. Interleaved stereo is downmixed to mono.
pub struct Pcm16Decoder {
    channels: u16,
}

impl Pcm16Decoder {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1),
        }
    }
}

impl AudioDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &[u8]) -> CodecResult<Vec<i16>> {
        let samples = bytes_to_samples(payload)?;
        if self.channels == 1 {
            return Ok(samples);
        }
        let channels = self.channels as usize;
        Ok(samples
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect())
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Pcm16
    }
}

/// Encoder that emits each frame as raw little-endian PCM16.
pub struct Pcm16Encoder {
    sample_rate: u32,
}

impl Pcm16Encoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioEncoder for Pcm16Encoder {
    fn encode_frame(&mut self, pcm: &[i16]) -> CodecResult<Bytes> {
        Ok(Bytes::from(samples_to_bytes(pcm)))
    }

    fn codec(&self) -> CodecTag {
        CodecTag::Pcm16
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_downmix() {
        let mut decoder = Pcm16Decoder::new(2);
        let payload = samples_to_bytes(&[100, 300, -50, -150]);
        let mono = decoder.decode(&payload).unwrap();
        assert_eq!(mono, vec![200, -100]);
    }
}
