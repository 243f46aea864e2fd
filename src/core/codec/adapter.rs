//! Session-scoped codec adapter: inbound decode and outbound 60 ms framing.

use bytes::Bytes;
use tracing::debug;

use super::{
    AudioDecoder, AudioEncoder, AudioFrame, CodecResult, CodecTag, PcmResampler,
    bytes_to_samples, create_decoder, create_encoder,
};

/// Owns one decoder and one encoder for a session.
///
/// `encode_pcm_stream` accepts arbitrary-sized PCM chunks, buffers them, and
/// emits full frames through the sink. At end of stream the last partial
/// frame is padded with silence so the device always receives whole frames.
pub struct CodecAdapter {
    decoder: Box<dyn AudioDecoder>,
    encoder: Box<dyn AudioEncoder>,
    resampler: Option<PcmResampler>,
    input_rate: u32,
    encode_buffer: Vec<i16>,
    pts_ms: u64,
}

impl CodecAdapter {
    pub fn new(decoder: Box<dyn AudioDecoder>, encoder: Box<dyn AudioEncoder>) -> Self {
        let input_rate = encoder.sample_rate();
        Self {
            decoder,
            encoder,
            resampler: None,
            input_rate,
            encode_buffer: Vec::new(),
            pts_ms: 0,
        }
    }

    /// Build an adapter from the negotiated inbound and outbound formats.
    pub fn from_formats(
        inbound: CodecTag,
        inbound_rate: u32,
        inbound_channels: u16,
        outbound: CodecTag,
        outbound_rate: u32,
    ) -> CodecResult<Self> {
        let decoder = create_decoder(inbound, inbound_rate, inbound_channels)?;
        let encoder = create_encoder(outbound, outbound_rate)?;
        Ok(Self::new(decoder, encoder))
    }

    /// Adapter used only for outbound encoding; decode passes PCM16 through.
    pub fn for_output(outbound: CodecTag, outbound_rate: u32) -> CodecResult<Self> {
        let encoder = create_encoder(outbound, outbound_rate)?;
        Ok(Self::new(Box::new(super::Pcm16Decoder::new(1)), encoder))
    }

    pub fn output_codec(&self) -> CodecTag {
        self.encoder.codec()
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.encoder.sample_rate()
    }

    /// Decode one inbound payload into PCM16 samples.
    pub fn decode(&mut self, payload: &[u8]) -> CodecResult<Vec<i16>> {
        self.decoder.decode(payload)
    }

    /// Declare the sample rate of PCM handed to `encode_pcm_stream`.
    ///
    /// A resampler is installed when it differs from the encoder rate.
    pub fn set_input_rate(&mut self, rate: u32) -> CodecResult<()> {
        if rate == self.input_rate {
            return Ok(());
        }
        self.input_rate = rate;
        self.resampler = if rate == self.encoder.sample_rate() {
            None
        } else {
            debug!(
                "Resampling TTS audio from {} Hz to {} Hz",
                rate,
                self.encoder.sample_rate()
            );
            Some(PcmResampler::new(rate, self.encoder.sample_rate())?)
        };
        Ok(())
    }

    /// Encode a chunk of PCM16 bytes, calling `sink` for every full frame.
    pub fn encode_pcm_stream<F>(
        &mut self,
        pcm_bytes: &[u8],
        end_of_stream: bool,
        mut sink: F,
    ) -> CodecResult<()>
    where
        F: FnMut(AudioFrame),
    {
        let samples = bytes_to_samples(pcm_bytes)?;
        let samples = match self.resampler.as_mut() {
            Some(resampler) => {
                let mut out = resampler.push(&samples)?;
                if end_of_stream {
                    out.extend(resampler.finish()?);
                }
                out
            }
            None => samples,
        };
        self.encode_buffer.extend_from_slice(&samples);

        let frame_samples = self.encoder.frame_samples();
        while self.encode_buffer.len() >= frame_samples {
            let frame: Vec<i16> = self.encode_buffer.drain(..frame_samples).collect();
            sink(self.encode(&frame)?);
        }

        if end_of_stream && !self.encode_buffer.is_empty() {
            let mut frame = std::mem::take(&mut self.encode_buffer);
            frame.resize(frame_samples, 0);
            sink(self.encode(&frame)?);
        }
        Ok(())
    }

    /// Drop buffered PCM, used when a synthesis turn is aborted.
    pub fn reset_encoder(&mut self) {
        self.encode_buffer.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            let _ = resampler.finish();
        }
    }

    fn encode(&mut self, frame: &[i16]) -> CodecResult<AudioFrame> {
        let data: Bytes = self.encoder.encode_frame(frame)?;
        let pts = self.pts_ms;
        self.pts_ms += u64::from(super::FRAME_DURATION_MS);
        Ok(AudioFrame::new(
            data,
            self.encoder.codec(),
            self.encoder.sample_rate(),
            self.encoder.channels(),
        )
        .with_pts(pts))
    }
}
