//! Voice Activity Segmenter: turns a stream of classified frames into sealed
//! [`Utterance`]s.
//!
//! Speech start needs a debounce run of consecutive active frames (transient
//! noise never opens an utterance); speech end needs a hangover window of
//! consecutive inactive frames (mid-utterance pauses never seal one). Sealed
//! utterances get a monotonic sequence number and are immutable afterwards.

use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use crate::vad::FrameClassifier;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Segmenter tuning. Durations are in milliseconds for config-file friendliness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// VAD aggressiveness, 0-3. Higher favors fewer false positives at the
    /// cost of missed quiet speech.
    pub aggressiveness: u8,

    /// Consecutive active frames required to declare speech started (default: 3).
    pub debounce_frames: usize,

    /// Trailing silence required to declare speech ended (default: 800ms).
    pub hangover_ms: u64,

    /// Utterances shorter than this are discarded as noise (default: 200ms).
    pub min_utterance_ms: u64,

    /// Utterances are force-sealed at this length to bound memory and latency
    /// (default: 30s).
    pub max_utterance_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            aggressiveness: 2,
            debounce_frames: 3,
            hangover_ms: 800,
            min_utterance_ms: 200,
            max_utterance_ms: 30_000,
        }
    }
}

impl SegmenterConfig {
    pub fn hangover(&self) -> Duration {
        Duration::from_millis(self.hangover_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }
}

/// A sealed span of candidate speech. Immutable once sealed.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Monotonically increasing sequence number, assigned at seal time.
    pub seq: u64,

    /// PCM samples (f32, -1.0..1.0) covering the speech span, trailing
    /// silence excluded.
    pub samples: Vec<f32>,

    /// Sample rate of the samples.
    pub sample_rate: u32,

    /// Speech duration (samples / sample_rate).
    pub duration: Duration,

    /// When the utterance was sealed.
    pub sealed_at: DateTime<Utc>,
}

/// Event emitted for an observed frame.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    /// Debounce run completed; an utterance is now open.
    SpeechStarted,

    /// Another active frame inside an open utterance.
    SpeechContinuing,

    /// Hangover window elapsed (or max duration hit); utterance sealed.
    SpeechEnded(Utterance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegState {
    /// No speech; nothing buffered.
    Idle,
    /// Active frames arriving but the debounce run is not complete yet.
    Opening,
    /// Utterance open, speech in progress.
    Speaking,
    /// Utterance open, counting trailing silence toward the hangover window.
    Trailing,
}

/// The segmenter itself. Feed it every captured frame via [`observe`];
/// it owns the frame buffer for the current (unsealed) utterance.
///
/// [`observe`]: VoiceSegmenter::observe
pub struct VoiceSegmenter {
    config: SegmenterConfig,
    // Not `Send`: the webrtc-vad classifier holds a raw model pointer, so the
    // segmenter is built on the thread that feeds it.
    classifier: Box<dyn FrameClassifier>,

    state: SegState,
    buffer: Vec<f32>,
    sample_rate: u32,
    /// Buffered samples up to and including the last active frame. Trailing
    /// silence past this point is cut when sealing.
    speech_len: usize,
    active_run: usize,
    trailing_silence: Duration,
    next_seq: u64,
}

impl VoiceSegmenter {
    pub fn new(config: SegmenterConfig, classifier: Box<dyn FrameClassifier>) -> Self {
        Self {
            config,
            classifier,
            state: SegState::Idle,
            buffer: Vec::new(),
            sample_rate: 0,
            speech_len: 0,
            active_run: 0,
            trailing_silence: Duration::ZERO,
            next_seq: 0,
        }
    }

    /// Observe one frame. Returns at most one event; discarded-as-noise
    /// utterances produce no event at all.
    pub fn observe(&mut self, frame: &AudioFrame) -> VoiceResult<Option<SegmentEvent>> {
        let active = self.classifier.is_active(&frame.samples)?;
        let frame_duration = frame.duration();

        match (self.state, active) {
            (SegState::Idle, false) => Ok(None),

            (SegState::Idle, true) => {
                self.buffer.clear();
                self.sample_rate = frame.sample_rate;
                self.push_active(frame);
                self.active_run = 1;
                self.state = if self.config.debounce_frames <= 1 {
                    debug!("speech started");
                    SegState::Speaking
                } else {
                    SegState::Opening
                };
                if self.state == SegState::Speaking {
                    Ok(Some(SegmentEvent::SpeechStarted))
                } else {
                    Ok(None)
                }
            }

            (SegState::Opening, true) => {
                self.push_active(frame);
                self.active_run += 1;
                if self.active_run >= self.config.debounce_frames {
                    debug!("speech started ({} frame debounce)", self.active_run);
                    self.state = SegState::Speaking;
                    Ok(Some(SegmentEvent::SpeechStarted))
                } else {
                    Ok(None)
                }
            }

            // A single inactive frame during the debounce run rejects the
            // whole run as transient noise.
            (SegState::Opening, false) => {
                self.reset();
                Ok(None)
            }

            (SegState::Speaking, true) => {
                self.push_active(frame);
                if self.buffered_duration() >= self.config.max_utterance() {
                    info!("max utterance duration reached, force-sealing");
                    return Ok(self.seal());
                }
                Ok(Some(SegmentEvent::SpeechContinuing))
            }

            (SegState::Speaking, false) => {
                self.buffer.extend_from_slice(&frame.samples);
                self.state = SegState::Trailing;
                self.trailing_silence = frame_duration;
                Ok(self.maybe_seal())
            }

            // Speech resumed before the hangover elapsed: the pause stays
            // inside the utterance.
            (SegState::Trailing, true) => {
                self.push_active(frame);
                self.trailing_silence = Duration::ZERO;
                self.state = SegState::Speaking;
                if self.buffered_duration() >= self.config.max_utterance() {
                    info!("max utterance duration reached, force-sealing");
                    return Ok(self.seal());
                }
                Ok(Some(SegmentEvent::SpeechContinuing))
            }

            (SegState::Trailing, false) => {
                self.buffer.extend_from_slice(&frame.samples);
                self.trailing_silence += frame_duration;
                Ok(self.maybe_seal())
            }
        }
    }

    /// Clear all run-length counters and the open buffer. Entry action of the
    /// listening phase.
    pub fn reset(&mut self) {
        self.state = SegState::Idle;
        self.buffer.clear();
        self.speech_len = 0;
        self.active_run = 0;
        self.trailing_silence = Duration::ZERO;
        self.classifier.reset();
    }

    /// Sequence number the next sealed utterance will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn push_active(&mut self, frame: &AudioFrame) {
        self.buffer.extend_from_slice(&frame.samples);
        self.speech_len = self.buffer.len();
    }

    fn buffered_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.speech_len as f64 / self.sample_rate as f64)
    }

    fn maybe_seal(&mut self) -> Option<SegmentEvent> {
        if self.trailing_silence >= self.config.hangover() {
            self.seal()
        } else {
            None
        }
    }

    /// Seal the open utterance: cut trailing silence, check the minimum
    /// duration, assign the sequence number, and reset.
    fn seal(&mut self) -> Option<SegmentEvent> {
        let duration = self.buffered_duration();

        if duration < self.config.min_utterance() {
            debug!("utterance too short ({:?}), discarding as noise", duration);
            self.reset();
            return None;
        }

        self.buffer.truncate(self.speech_len);
        let utterance = Utterance {
            seq: self.next_seq,
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.sample_rate,
            duration,
            sealed_at: Utc::now(),
        };
        self.next_seq += 1;

        info!(
            "utterance #{} sealed: {:?}, {} samples",
            utterance.seq,
            utterance.duration,
            utterance.samples.len()
        );

        self.reset();
        Some(SegmentEvent::SpeechEnded(utterance))
    }
}
