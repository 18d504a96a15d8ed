//! Per-frame speech/silence classification.
//!
//! Two classifiers implement [`FrameClassifier`]: the WebRTC VAD (spectral,
//! aggressiveness 0-3) for production, and a plain RMS-energy threshold that
//! needs no native model, used as a fallback and in tests. Both are O(1) per
//! frame and never suspend.

use crate::error::{VoiceError, VoiceResult};
use tracing::info;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies one audio frame as active speech or silence.
pub trait FrameClassifier {
    /// Score a frame. Returns `true` if the frame contains speech activity.
    fn is_active(&mut self, samples: &[f32]) -> VoiceResult<bool>;

    /// Clear any per-session state.
    fn reset(&mut self);
}

/// WebRTC VAD wrapper. Requires 10/20/30ms frames at 8/16/32/48 kHz.
pub struct WebRtcClassifier {
    vad: Vad,
    sample_rate: u32,
    aggressiveness: u8,
    frame_size: usize,
}

fn vad_mode(aggressiveness: u8) -> VoiceResult<VadMode> {
    match aggressiveness {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        n => Err(VoiceError::Config(format!(
            "VAD aggressiveness must be 0-3, got {}",
            n
        ))),
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        n => Err(VoiceError::Config(format!(
            "WebRTC VAD supports 8000/16000/32000/48000 Hz, got {}",
            n
        ))),
    }
}

impl WebRtcClassifier {
    pub fn new(sample_rate: u32, aggressiveness: u8, frame_size: usize) -> VoiceResult<Self> {
        let mode = vad_mode(aggressiveness)?;
        let rate = vad_rate(sample_rate)?;

        // WebRTC VAD only accepts 10ms, 20ms, or 30ms frames.
        let ms = frame_size as u64 * 1000 / sample_rate as u64;
        if !matches!(ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "frame size {} is {}ms at {}Hz; WebRTC VAD needs 10/20/30ms frames",
                frame_size, ms, sample_rate
            )));
        }

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);

        info!(
            "WebRTC VAD ready ({}Hz, aggressiveness {}, {} samples/frame)",
            sample_rate, aggressiveness, frame_size
        );

        Ok(Self {
            vad,
            sample_rate,
            aggressiveness,
            frame_size,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn is_active(&mut self, samples: &[f32]) -> VoiceResult<bool> {
        if samples.len() != self.frame_size {
            return Err(VoiceError::Vad(format!(
                "expected {} samples, got {}",
                self.frame_size,
                samples.len()
            )));
        }

        let pcm: Vec<i16> = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        self.vad
            .is_voice_segment(&pcm)
            .map_err(|e| VoiceError::Vad(format!("VAD scoring failed: {:?}", e)))
    }

    fn reset(&mut self) {
        // WebRTC VAD has no explicit reset; rebuild the instance. The mode and
        // rate were validated at construction, so this cannot fail.
        let mut vad = Vad::new();
        if let Ok(mode) = vad_mode(self.aggressiveness) {
            vad.set_mode(mode);
        }
        if let Ok(rate) = vad_rate(self.sample_rate) {
            vad.set_sample_rate(rate);
        }
        self.vad = vad;
    }
}

/// Energy-threshold classifier: a frame is active when its RMS exceeds the
/// threshold. Deterministic and model-free.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// RMS threshold above which a frame counts as speech (default: 0.01).
    pub threshold: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self { threshold: 0.01 }
    }
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl FrameClassifier for EnergyClassifier {
    fn is_active(&mut self, samples: &[f32]) -> VoiceResult<bool> {
        if samples.is_empty() {
            return Ok(false);
        }
        let mean_square =
            samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32;
        Ok(mean_square.sqrt() > self.threshold)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webrtc_rejects_bad_aggressiveness() {
        let result = WebRtcClassifier::new(16000, 4, 480);
        assert!(result.is_err());
    }

    #[test]
    fn webrtc_rejects_bad_sample_rate() {
        let result = WebRtcClassifier::new(44100, 2, 480);
        assert!(result.is_err());
    }

    #[test]
    fn webrtc_rejects_bad_frame_size() {
        // 100 samples at 16kHz is 6.25ms, not a legal VAD frame.
        let result = WebRtcClassifier::new(16000, 2, 100);
        assert!(result.is_err());
    }

    #[test]
    fn webrtc_silence_is_inactive() {
        let mut vad = WebRtcClassifier::new(16000, 3, 480).unwrap();
        let silence = vec![0.0f32; 480];
        assert!(!vad.is_active(&silence).unwrap());
    }

    #[test]
    fn webrtc_frame_size_mismatch_errors() {
        let mut vad = WebRtcClassifier::new(16000, 2, 480).unwrap();
        assert!(vad.is_active(&vec![0.0f32; 100]).is_err());
    }

    #[test]
    fn energy_classifier_thresholds() {
        let mut clf = EnergyClassifier::default();
        assert!(!clf.is_active(&vec![0.0f32; 480]).unwrap());
        assert!(clf.is_active(&vec![0.5f32; 480]).unwrap());
        assert!(!clf.is_active(&[]).unwrap());
    }
}
