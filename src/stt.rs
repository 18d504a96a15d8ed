//! Transcription adapter: sealed [`Utterance`] PCM in, UTF-8 text out.
//!
//! The contract is pure request/response with no retry built in; the
//! orchestrator decides what a failure means. Calls may take seconds and are
//! always run off the capture and phase-machine contexts.

use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::Utterance;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Backend for converting an utterance to text.
pub trait SttBackend: Send + Sync {
    /// Transcribe one utterance. Return an empty string when nothing
    /// intelligible was detected (the orchestrator treats that as a
    /// clarification-prompt path, not an error).
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String>;
}

/// Encode f32 PCM (mono) as 16-bit little-endian WAV bytes for API upload.
fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    let header = |buf: &mut Vec<u8>, tag: &[u8; 4]| buf.extend_from_slice(tag);

    header(&mut buf, b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    header(&mut buf, b"WAVE");

    header(&mut buf, b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    header(&mut buf, b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        let pcm = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&pcm.to_le_bytes());
    }
    buf
}

/// Scripted STT: returns queued lines in order, then empty strings. Drives
/// the orchestrator in tests and demos without a model.
#[derive(Debug, Default)]
pub struct ScriptedStt {
    lines: Mutex<VecDeque<String>>,
}

impl ScriptedStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
        }
    }
}

impl SttBackend for ScriptedStt {
    fn transcribe(&self, _utterance: &Utterance) -> VoiceResult<String> {
        let mut lines = self.lines.lock().expect("scripted stt lock poisoned");
        Ok(lines.pop_front().unwrap_or_default())
    }
}

/// Production STT: OpenAI-compatible transcription API.
/// Configured via `STT_API_URL` (default https://api.openai.com/v1),
/// `STT_API_KEY`, and `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model name, e.g. whisper-1 or gpt-4o-transcribe.
    pub model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiStt {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

impl SttBackend for OpenAiStt {
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(&utterance.samples, utterance.sample_rate);
        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::TranscriptionFailed(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(text)
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Sample rate the ggml Whisper models are trained on. The capture
    /// pipeline runs at this rate by default; anything else needs resampling
    /// upstream, which this backend refuses to guess at.
    const WHISPER_RATE: u32 = 16_000;

    /// On-device transcription through whisper.cpp, so an interview can run
    /// fully offline. The model loads once; a single reusable inference state
    /// sits behind a mutex because utterances arrive strictly one at a time.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
        language: String,
    }

    impl WhisperStt {
        /// Load a ggml model file (e.g. ggml-base.en.bin).
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let context =
                WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                    .map_err(|e| {
                        VoiceError::TranscriptionFailed(format!(
                            "could not load whisper model {}: {}",
                            model_path, e
                        ))
                    })?;
            let state = context.create_state().map_err(|e| {
                VoiceError::TranscriptionFailed(format!("whisper state init failed: {}", e))
            })?;
            Ok(Self {
                context,
                state: Mutex::new(state),
                language: "en".to_string(),
            })
        }

        /// Override the transcription language (ISO 639-1 code).
        pub fn with_language(mut self, language: impl Into<String>) -> Self {
            self.language = language.into();
            self
        }

        /// Build from env: `WHISPER_MODEL_PATH` points at the model file and
        /// `WHISPER_LANGUAGE` optionally overrides the default English.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            let backend = Self::new(path)?;
            match std::env::var("WHISPER_LANGUAGE") {
                Ok(lang) if !lang.trim().is_empty() => Ok(backend.with_language(lang.trim())),
                _ => Ok(backend),
            }
        }

        fn inference_params(&self) -> FullParams<'_, '_> {
            // Greedy decoding: an interview answer does not need beam search,
            // and latency here directly delays the reply.
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some(&self.language));
            params.set_no_timestamps(true);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
            if utterance.sample_rate != WHISPER_RATE {
                return Err(VoiceError::TranscriptionFailed(format!(
                    "whisper models run at {} Hz; utterance was sealed at {} Hz",
                    WHISPER_RATE, utterance.sample_rate
                )));
            }
            if utterance.samples.is_empty() {
                return Ok(String::new());
            }

            let params = self.inference_params();
            let mut state = self.state.lock().map_err(|e| {
                VoiceError::TranscriptionFailed(format!("whisper state lock poisoned: {}", e))
            })?;
            state.full(&params, &utterance.samples).map_err(|e| {
                VoiceError::TranscriptionFailed(format!("whisper inference failed: {}", e))
            })?;

            let mut text = String::new();
            for segment in state.as_iter() {
                if let Ok(piece) = segment.to_str() {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(piece.trim());
                }
            }
            Ok(text)
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend from environment.
/// Priority: WhisperStt when `WHISPER_MODEL_PATH` is set and loads (needs the
/// `whisper` feature), then OpenAiStt when a key is present, then ScriptedStt.
pub fn create_best_stt() -> Box<dyn SttBackend> {
    #[cfg(feature = "whisper")]
    {
        if let Ok(w) = WhisperStt::from_env() {
            return Box::new(w);
        }
    }
    if let Ok(stt) = OpenAiStt::from_env() {
        return Box::new(stt);
    }
    Box::new(ScriptedStt::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn utterance(samples: Vec<f32>) -> Utterance {
        Utterance {
            seq: 0,
            sample_rate: 16000,
            duration: Duration::from_secs_f64(samples.len() as f64 / 16000.0),
            sealed_at: Utc::now(),
            samples,
        }
    }

    #[test]
    fn scripted_pops_lines_then_goes_silent() {
        let stt = ScriptedStt::with_lines(["hello", "world"]);
        let u = utterance(vec![0.0; 480]);
        assert_eq!(stt.transcribe(&u).unwrap(), "hello");
        assert_eq!(stt.transcribe(&u).unwrap(), "world");
        assert_eq!(stt.transcribe(&u).unwrap(), "");
    }

    #[test]
    fn wav_header_is_well_formed() {
        let wav = pcm_to_wav(&[0.0, 0.5, -0.5, 1.0], 16000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        // 44-byte header + 2 bytes per sample.
        assert_eq!(wav.len(), 44 + 8);
        // data length field
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 8);
    }

    #[test]
    fn wav_clamps_out_of_range_samples() {
        let wav = pcm_to_wav(&[2.0, -2.0], 16000);
        let hi = i16::from_le_bytes(wav[44..46].try_into().unwrap());
        let lo = i16::from_le_bytes(wav[46..48].try_into().unwrap());
        assert_eq!(hi, 32767);
        assert_eq!(lo, -32767);
    }
}
