//! Streaming PCM16 resampler built on rubato's FFT resampler.

use rubato::{FftFixedIn, Resampler};

use super::{CodecError, CodecResult};

/// Input chunk size handed to rubato per call
const CHUNK_SIZE: usize = 1024;

/// Converts a mono PCM16 stream from one sample rate to another.
///
/// Samples are accumulated until a full input chunk is available; call
/// [`PcmResampler::finish`] at end of stream to flush the remainder.
pub struct PcmResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl PcmResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> CodecResult<Self> {
        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            CHUNK_SIZE,
            2,
            1,
        )
        .map_err(|e| CodecError::Resample(format!("Failed to create resampler: {e}")))?;
        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            input_rate,
            output_rate,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Feed samples; returns whatever output is ready.
    pub fn push(&mut self, samples: &[i16]) -> CodecResult<Vec<i16>> {
        self.pending
            .extend(samples.iter().map(|s| *s as f32 / 32768.0));

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| CodecError::Resample(e.to_string()))?;
            if let Some(channel) = resampled.first() {
                out.extend(channel.iter().map(|s| to_i16(*s)));
            }
        }
        Ok(out)
    }

    /// Flush buffered samples at end of stream.
    pub fn finish(&mut self) -> CodecResult<Vec<i16>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = std::mem::take(&mut self.pending);
        let resampled = self
            .inner
            .process_partial(Some(&[chunk]), None)
            .map_err(|e| CodecError::Resample(e.to_string()))?;
        Ok(resampled
            .first()
            .map(|channel| channel.iter().map(|s| to_i16(*s)).collect())
            .unwrap_or_default())
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_length_is_proportional() {
        let mut resampler = PcmResampler::new(24000, 16000).unwrap();
        let input = vec![1000i16; 24000];
        let mut output = resampler.push(&input).unwrap();
        output.extend(resampler.finish().unwrap());
        // One second in, roughly one second out (rubato adds a short delay)
        assert!(output.len() > 14000, "got {} samples", output.len());
        assert!(output.len() < 18000, "got {} samples", output.len());
    }
}
