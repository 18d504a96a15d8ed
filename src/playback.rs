//! Speech synthesis backends and the playback controller.
//!
//! The controller exposes exactly one "currently speaking" slot: a second
//! `start` while a [`PlaybackHandle`] is live fails with `PlaybackBusy`
//! instead of queuing silently. `stop` is callable from any thread and is
//! idempotent, which is what makes barge-in and shutdown safe to race with
//! natural completion. The rodio output stream is built lazily and rebuilt
//! lazily after a failure rather than reusing a possibly-corrupted engine.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use serde_json::json;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Backend that turns reply text into playable audio bytes (WAV/MP3).
pub trait TtsBackend: Send + Sync {
    /// Synthesize text. Return an empty vec to skip playback entirely.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Silent TTS: always returns empty audio. Keeps the orchestration loop
/// runnable without a voice (tests, headless demos).
#[derive(Debug, Default)]
pub struct SilentTts;

impl TtsBackend for SilentTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Production TTS: OpenAI-compatible speech API.
/// Configured via `TTS_API_URL` (default https://api.openai.com/v1),
/// `TTS_API_KEY`, `TTS_MODEL` (default tts-1), and `TTS_VOICE` (default alloy).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    client: reqwest::blocking::Client,
}

impl OpenAiTts {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Self::new(base_url, api_key, model, voice)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }
}

impl TtsBackend for OpenAiTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::SynthesisFailed(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Create the best available TTS backend from environment.
pub fn create_best_tts() -> Box<dyn TtsBackend> {
    if let Ok(tts) = OpenAiTts::from_env() {
        return Box::new(tts);
    }
    Box::new(SilentTts)
}

/// State shared between the controller, live handles, and remotes. The gate
/// flag is the single-slot invariant; the sink slot lets `stop` reach the
/// audio from any thread.
#[derive(Default)]
struct PlaybackShared {
    active: AtomicBool,
    current: Mutex<Option<Arc<Sink>>>,
}

// Manual impl because `rodio::Sink` does not implement `Debug`.
impl std::fmt::Debug for PlaybackShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackShared")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl PlaybackShared {
    fn release(&self) {
        if let Ok(mut current) = self.current.lock() {
            current.take();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Cheap, cloneable, `Send + Sync` view of the controller. Carries the
/// interrupt path (`stop`) across execution-context boundaries.
#[derive(Debug, Clone)]
pub struct PlaybackRemote {
    shared: Arc<PlaybackShared>,
}

impl PlaybackRemote {
    /// Forcibly release the output device and fall silent. Safe to call from
    /// any thread, any number of times, including while nothing is playing.
    pub fn stop(&self) {
        let sink = self
            .shared
            .current
            .lock()
            .ok()
            .and_then(|mut current| current.take());
        if let Some(sink) = sink {
            sink.stop();
            info!("playback stopped (interrupt)");
        }
        self.shared.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

/// One in-flight speech-output operation. Owns the single playback slot for
/// its lifetime; dropping it (or `wait`ing it out) releases the slot.
pub struct PlaybackHandle {
    shared: Arc<PlaybackShared>,
    sink: Option<Arc<Sink>>,
}

impl PlaybackHandle {
    /// Block until playback finishes naturally or is stopped. Run this on a
    /// blocking-friendly context; the handle is `Send`.
    pub fn wait(self) {
        if let Some(sink) = &self.sink {
            sink.sleep_until_end();
        }
        // Release happens in Drop.
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Lazily-built rodio engine. The stream handle stays warm across playbacks;
/// a fresh `Sink` is created per playback so an interrupted one never gets
/// reused.
struct Engine {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

/// The playback controller. Not `Send` (the rodio `OutputStream` is tied to
/// its thread); it lives with the orchestrator, while [`PlaybackRemote`]
/// clones travel anywhere.
pub struct PlaybackController {
    shared: Arc<PlaybackShared>,
    engine: Option<Engine>,
}

impl Default for PlaybackController {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackController {
    /// Create the controller. No device is touched until the first non-empty
    /// `start`.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PlaybackShared::default()),
            engine: None,
        }
    }

    pub fn remote(&self) -> PlaybackRemote {
        PlaybackRemote {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Same interrupt path as [`PlaybackRemote::stop`].
    pub fn stop(&self) {
        self.remote().stop();
    }

    /// Begin playing `audio` and return the live handle. Fails with
    /// `PlaybackBusy` when a handle is already active. Empty audio acquires
    /// and releases the slot without touching the device.
    pub fn start(&mut self, audio: &[u8]) -> VoiceResult<PlaybackHandle> {
        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VoiceError::PlaybackBusy);
        }

        if audio.is_empty() {
            debug!("empty audio; playback slot passes through");
            return Ok(PlaybackHandle {
                shared: Arc::clone(&self.shared),
                sink: None,
            });
        }

        match self.begin_playback(audio) {
            Ok(sink) => {
                if let Ok(mut current) = self.shared.current.lock() {
                    *current = Some(Arc::clone(&sink));
                }
                Ok(PlaybackHandle {
                    shared: Arc::clone(&self.shared),
                    sink: Some(sink),
                })
            }
            Err(e) => {
                // Drop the engine so the next start rebuilds it from scratch
                // instead of reusing a possibly-corrupted instance.
                self.engine = None;
                self.shared.release();
                Err(e)
            }
        }
    }

    fn begin_playback(&mut self, audio: &[u8]) -> VoiceResult<Arc<Sink>> {
        if self.engine.is_none() {
            let (stream, handle) = OutputStream::try_default()
                .map_err(|e| VoiceError::Playback(e.to_string()))?;
            self.engine = Some(Engine {
                _stream: stream,
                handle,
            });
            info!("playback engine ready");
        }
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| VoiceError::Playback("engine unavailable".to_string()))?;

        let sink = Sink::try_new(&engine.handle)
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        let source = rodio::Decoder::new(Cursor::new(audio.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("decode failed: {}", e)))?;
        sink.append(source.convert_samples::<f32>());
        Ok(Arc::new(sink))
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_tts_returns_empty() {
        let tts = SilentTts;
        assert!(tts.synthesize("hello").unwrap().is_empty());
    }

    #[test]
    fn second_start_fails_busy() {
        let mut playback = PlaybackController::new();
        let handle = playback.start(&[]).unwrap();
        assert!(playback.is_active());
        assert!(matches!(playback.start(&[]), Err(VoiceError::PlaybackBusy)));
        drop(handle);
        assert!(!playback.is_active());
    }

    #[test]
    fn slot_is_reusable_after_release() {
        let mut playback = PlaybackController::new();
        for _ in 0..3 {
            let handle = playback.start(&[]).unwrap();
            handle.wait();
            assert!(!playback.is_active());
        }
    }

    #[test]
    fn stop_is_idempotent_and_releases() {
        let mut playback = PlaybackController::new();
        let remote = playback.remote();

        // Nothing playing: both are quiet no-ops.
        remote.stop();
        remote.stop();

        let handle = playback.start(&[]).unwrap();
        remote.stop();
        assert!(!remote.is_active());
        remote.stop();

        // The stale handle still waits out and re-releases harmlessly.
        handle.wait();
        assert!(!playback.is_active());

        // And the slot accepts the next start without reinitialization.
        let handle = playback.start(&[]).unwrap();
        drop(handle);
    }

    #[test]
    fn remote_sees_controller_state() {
        let mut playback = PlaybackController::new();
        let remote = playback.remote();
        assert!(!remote.is_active());
        let handle = playback.start(&[]).unwrap();
        assert!(remote.is_active());
        drop(handle);
        assert!(!remote.is_active());
    }
}
