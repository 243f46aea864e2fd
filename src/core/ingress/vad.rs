//! Voice detector backends.
//!
//! A detector turns one PCM chunk into a speech probability in `[0, 1]`.
//! Model-based detectors live outside this crate and plug in through
//! [`VoiceDetector`]; [`EnergyVoiceDetector`] is the built-in fallback.

/// Per-chunk speech probability estimator.
pub trait VoiceDetector: Send {
    fn speech_probability(&mut self, pcm: &[i16]) -> f32;

    fn reset(&mut self) {}

    fn name(&self) -> &'static str;
}

/// RMS energy detector.
///
/// The RMS level is mapped linearly between `floor_db` (probability 0) and
/// `ceiling_db` (probability 1).
pub struct EnergyVoiceDetector {
    floor_db: f32,
    ceiling_db: f32,
}

impl EnergyVoiceDetector {
    pub fn new(floor_db: f32, ceiling_db: f32) -> Self {
        Self {
            floor_db,
            ceiling_db: ceiling_db.max(floor_db + 1.0),
        }
    }
}

impl Default for EnergyVoiceDetector {
    fn default() -> Self {
        Self::new(-50.0, -20.0)
    }
}

impl VoiceDetector for EnergyVoiceDetector {
    fn speech_probability(&mut self, pcm: &[i16]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = pcm
            .iter()
            .map(|s| {
                let v = *s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        let rms = (sum_sq / pcm.len() as f64).sqrt();
        if rms <= f64::EPSILON {
            return 0.0;
        }
        let db = 20.0 * rms.log10() as f32;
        ((db - self.floor_db) / (self.ceiling_db - self.floor_db)).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let mut vad = EnergyVoiceDetector::default();
        assert_eq!(vad.speech_probability(&[0; 320]), 0.0);
        assert_eq!(vad.speech_probability(&[]), 0.0);
    }

    #[test]
    fn test_loud_signal_is_voiced() {
        let mut vad = EnergyVoiceDetector::default();
        let loud: Vec<i16> = (0..320)
            .map(|i| if i % 2 == 0 { 12000 } else { -12000 })
            .collect();
        assert!(vad.speech_probability(&loud) > 0.9);
    }

    #[test]
    fn test_quiet_signal_is_unvoiced() {
        let mut vad = EnergyVoiceDetector::default();
        let quiet: Vec<i16> = (0..320).map(|i| if i % 2 == 0 { 20 } else { -20 }).collect();
        assert!(vad.speech_probability(&quiet) < 0.2);
    }
}
