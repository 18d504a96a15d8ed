//! Turn orchestrator: the phase machine tying capture, segmentation,
//! transcription, generation, synthesis, and playback into one loop.
//!
//! Concurrency layout: the cpal callback delivers frames to a dedicated VAD
//! thread (webrtc-vad is not `Send`); sealed utterances cross a channel to the
//! orchestrator task running this phase machine; adapter calls go through
//! `spawn_blocking` so neither the capture pipeline nor the runtime stalls.
//! The conversation lock is held only for atomic appends and phase writes,
//! never across an adapter call.

use crate::audio::{AudioCapture, AudioConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::generator::{GeneratorConfig, ResponseGenerator, FALLBACK_OPENING};
use crate::playback::{PlaybackController, PlaybackRemote, TtsBackend};
use crate::segmenter::{SegmentEvent, SegmenterConfig, Utterance, VoiceSegmenter};
use crate::state::{
    matches_closing_phrase, Conversation, ConversationSnapshot, DiscardTranscriptSink, Phase,
    Speaker, TranscriptSink,
};
use crate::stt::SttBackend;
use crate::vad::WebRtcClassifier;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Spoken when transcription or generation fails but retries remain.
const REPEAT_PROMPT: &str = "I'm sorry, could you repeat that?";
/// Spoken when transcription comes back empty or unintelligible.
const CLARIFY_PROMPT: &str = "I didn't quite catch that. Could you say it again?";
/// Spoken when no utterance arrives within the silence window.
const NUDGE_PROMPT: &str = "No rush - are you still there?";
/// Appended and spoken when a closing phrase ends the interview.
const CLOSING_MESSAGE: &str = "It was a pleasure speaking with you. Goodbye!";
/// Appended and spoken when the retry budget is exhausted.
const EXHAUSTED_MESSAGE: &str =
    "I'm having persistent trouble on my end, so let's stop here. Thank you for your time!";

/// Session-level knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Phrases that end the interview when found in candidate text
    /// (case-insensitive substring match on the transcription).
    pub closing_phrases: Vec<String>,

    /// Recoverable adapter failures tolerated per turn before the session
    /// ends gracefully (default: 2).
    pub max_retries_per_turn: u32,

    /// Seconds of no committed utterance before a spoken nudge (default: 30).
    pub silence_nudge_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            closing_phrases: vec!["goodbye".to_string(), "thank you".to_string()],
            max_retries_per_turn: 2,
            silence_nudge_secs: 30,
        }
    }
}

/// Full configuration surface of the core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterviewConfig {
    pub audio: AudioConfig,
    pub segmenter: SegmenterConfig,
    pub generator: GeneratorConfig,
    pub session: SessionConfig,
}

impl InterviewConfig {
    /// Validate cross-field constraints before any device is opened.
    pub fn validate(&self) -> VoiceResult<()> {
        if !matches!(self.audio.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "sample rate {} is not supported by the VAD",
                self.audio.sample_rate
            )));
        }
        let frame_ms =
            self.audio.frame_size as u64 * 1000 / self.audio.sample_rate as u64;
        if !matches!(frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "frame size {} is {}ms at {}Hz; VAD needs 10/20/30ms frames",
                self.audio.frame_size, frame_ms, self.audio.sample_rate
            )));
        }
        if self.segmenter.aggressiveness > 3 {
            return Err(VoiceError::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.segmenter.aggressiveness
            )));
        }
        if self.segmenter.min_utterance_ms > self.segmenter.max_utterance_ms {
            return Err(VoiceError::Config(
                "min utterance duration exceeds max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Front-end control surface: read-only snapshots plus the one control
/// action, `request_stop`. Clones freely across threads.
#[derive(Clone)]
pub struct SessionControl {
    conversation: Conversation,
    playback: PlaybackRemote,
}

impl SessionControl {
    /// Trigger the interrupt path: release the output device immediately and
    /// end the session. Idempotent; safe to race with normal completion.
    pub fn request_stop(&self) {
        self.playback.stop();
        self.conversation.set_phase(Phase::Ended);
        info!("stop requested");
    }

    pub fn phase(&self) -> Phase {
        self.conversation.phase()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.conversation.snapshot()
    }
}

/// The interview orchestrator.
pub struct InterviewOrchestrator {
    config: InterviewConfig,
    conversation: Conversation,
    stt: Arc<dyn SttBackend>,
    generator: Arc<dyn ResponseGenerator>,
    tts: Arc<dyn TtsBackend>,
    playback: PlaybackController,
    transcript_sink: Box<dyn TranscriptSink>,
    retries_this_turn: u32,
    last_transcribed_seq: Option<u64>,
    /// Wall-clock span of the most recent `speak` call. Utterances sealed
    /// inside it are the interviewer's own audio leaking back through the
    /// mic and are dropped before transcription.
    last_speech_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl InterviewOrchestrator {
    pub fn new(
        config: InterviewConfig,
        stt: Arc<dyn SttBackend>,
        generator: Arc<dyn ResponseGenerator>,
        tts: Arc<dyn TtsBackend>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            conversation: Conversation::new(),
            stt,
            generator,
            tts,
            playback: PlaybackController::new(),
            transcript_sink: Box::new(DiscardTranscriptSink),
            retries_this_turn: 0,
            last_transcribed_seq: None,
            last_speech_window: None,
        })
    }

    /// Collaborator that receives the finalized transcript on `ended`.
    pub fn with_transcript_sink(mut self, sink: Box<dyn TranscriptSink>) -> Self {
        self.transcript_sink = sink;
        self
    }

    /// Shared conversation handle for front-end reads.
    pub fn conversation(&self) -> Conversation {
        self.conversation.clone()
    }

    /// Control handle for the front end. Obtain before `run` consumes self.
    pub fn control(&self) -> SessionControl {
        SessionControl {
            conversation: self.conversation.clone(),
            playback: self.playback.remote(),
        }
    }

    /// Run a full session against live microphone capture. Keeps the capture
    /// stream alive for the duration; the input device is owned here for the
    /// process lifetime.
    pub async fn run_with_mic(self) -> VoiceResult<()> {
        let capture = AudioCapture::new(self.config.audio.clone())?;
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let stream = capture.start(frame_tx)?;

        let (utterance_tx, utterance_rx) = mpsc::channel(16);
        let segmenter_config = self.config.segmenter.clone();
        let audio_config = self.config.audio.clone();
        let conversation = self.conversation.clone();

        // webrtc-vad is not Send: classify and segment on a dedicated thread.
        thread::spawn(move || {
            let classifier = match WebRtcClassifier::new(
                audio_config.sample_rate,
                segmenter_config.aggressiveness,
                audio_config.frame_size,
            ) {
                Ok(c) => c,
                Err(e) => {
                    error!("VAD init failed: {}", e);
                    return;
                }
            };
            let mut segmenter = VoiceSegmenter::new(segmenter_config, Box::new(classifier));

            while let Some(frame) = frame_rx.blocking_recv() {
                // Only the listening phase feeds the segmenter: the
                // interviewer's own playback never opens an utterance, and
                // listening always resumes from a clean debounce state.
                if conversation.phase() != Phase::Listening {
                    segmenter.reset();
                    continue;
                }
                match segmenter.observe(&frame) {
                    Ok(Some(SegmentEvent::SpeechEnded(utterance))) => {
                        if utterance_tx.blocking_send(utterance).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("segmenter error: {}", e),
                }
            }
            info!("segmenter thread ended");
        });

        let result = self.run(utterance_rx).await;
        drop(stream);
        result
    }

    /// Run a full session from an already-segmented utterance stream. This is
    /// the phase machine proper; `run_with_mic` wires real capture to it.
    pub async fn run(mut self, mut utterances: mpsc::Receiver<Utterance>) -> VoiceResult<()> {
        info!("interview session starting");

        // Opening question: generator first, canned greeting as fallback.
        let generator = Arc::clone(&self.generator);
        let opening = tokio::task::spawn_blocking(move || generator.opening())
            .await
            .map_err(|e| VoiceError::ChannelClosed(e.to_string()))?
            .unwrap_or_else(|e| {
                warn!("opening generation failed: {}; using canned greeting", e);
                FALLBACK_OPENING.to_string()
            });
        self.conversation.append(Speaker::Interviewer, &opening);
        info!("Interviewer: {}", opening);
        self.conversation.set_phase(Phase::Speaking);
        self.speak(&opening).await?;
        self.conversation.set_phase(Phase::Listening);

        let nudge_window = Duration::from_secs(self.config.session.silence_nudge_secs.max(1));

        while !self.conversation.is_ended() {
            let utterance = match timeout(nudge_window, utterances.recv()).await {
                Err(_) => {
                    if self.conversation.is_ended() {
                        break;
                    }
                    info!("no speech detected for a while; nudging");
                    self.conversation.set_phase(Phase::Speaking);
                    self.speak(NUDGE_PROMPT).await?;
                    self.conversation.set_phase(Phase::Listening);
                    continue;
                }
                Ok(None) => {
                    // Capture pipeline is gone; nothing more can arrive.
                    warn!("utterance channel closed; ending session");
                    break;
                }
                Ok(Some(u)) => u,
            };

            // An utterance is never transcribed twice.
            if self
                .last_transcribed_seq
                .is_some_and(|seq| utterance.seq <= seq)
            {
                continue;
            }
            // Anything sealed while the interviewer was speaking is echo of
            // our own playback; it never becomes a candidate turn.
            if self
                .last_speech_window
                .is_some_and(|(from, until)| {
                    utterance.sealed_at >= from && utterance.sealed_at <= until
                })
            {
                info!(
                    "utterance #{} sealed during interviewer speech; dropped as echo",
                    utterance.seq
                );
                continue;
            }
            if self.conversation.phase() != Phase::Listening {
                continue;
            }
            self.last_transcribed_seq = Some(utterance.seq);

            if self.handle_utterance(utterance).await? {
                break;
            }
        }

        self.finalize()
    }

    /// Drive one utterance through transcribe -> generate -> speak.
    /// Returns `true` when the session should end.
    async fn handle_utterance(&mut self, utterance: Utterance) -> VoiceResult<bool> {
        self.conversation.set_phase(Phase::Transcribing);
        let stt = Arc::clone(&self.stt);
        let transcription = tokio::task::spawn_blocking(move || stt.transcribe(&utterance))
            .await
            .map_err(|e| VoiceError::ChannelClosed(e.to_string()))?;

        let text = match transcription {
            Err(e) => {
                warn!("transcription failed: {}", e);
                return self.recoverable_failure(REPEAT_PROMPT).await;
            }
            Ok(raw) => {
                let trimmed = raw.trim().to_string();
                // Very short transcriptions are noise, same as empty ones.
                if trimmed.len() <= 2 {
                    info!("unintelligible transcription; asking to repeat");
                    self.conversation.set_phase(Phase::Speaking);
                    self.speak(CLARIFY_PROMPT).await?;
                    self.conversation.set_phase(Phase::Listening);
                    return Ok(false);
                }
                trimmed
            }
        };

        // Snapshot history before the atomic candidate append so the
        // generator sees everything up to (not including) this turn.
        let history = self
            .conversation
            .recent_turns(self.config.generator.context_turns);
        self.conversation.append(Speaker::Candidate, &text);
        info!("Candidate: {}", text);

        // Closing phrases are checked on transcribed text, never raw audio.
        if matches_closing_phrase(&text, &self.config.session.closing_phrases) {
            info!("closing phrase detected; ending interview");
            self.conversation.append(Speaker::Interviewer, CLOSING_MESSAGE);
            self.conversation.set_phase(Phase::Speaking);
            self.speak(CLOSING_MESSAGE).await?;
            self.conversation.set_phase(Phase::Ended);
            return Ok(true);
        }

        self.conversation.set_phase(Phase::Generating);
        let generator = Arc::clone(&self.generator);
        let candidate_text = text.clone();
        let reply = tokio::task::spawn_blocking(move || generator.reply(&history, &candidate_text))
            .await
            .map_err(|e| VoiceError::ChannelClosed(e.to_string()))?;

        let reply = match reply {
            Err(e) => {
                warn!("generation failed: {}", e);
                return self.recoverable_failure(REPEAT_PROMPT).await;
            }
            Ok(r) => r,
        };

        // The interviewer turn is appended before synthesis begins, so a
        // synthesis crash still leaves a readable transcript.
        self.conversation.append(Speaker::Interviewer, &reply);
        info!("Interviewer: {}", reply);
        self.conversation.set_phase(Phase::Speaking);
        self.speak(&reply).await?;
        self.conversation.set_phase(Phase::Listening);
        // Only a completed cycle clears the budget; consecutive failures
        // accumulate across turns until the session ends gracefully.
        self.retries_this_turn = 0;

        Ok(self.conversation.is_ended())
    }

    /// Shared path for recoverable adapter failures: bounded retries with a
    /// spoken prompt, then a graceful end.
    async fn recoverable_failure(&mut self, prompt: &str) -> VoiceResult<bool> {
        self.retries_this_turn += 1;
        if self.retries_this_turn > self.config.session.max_retries_per_turn {
            warn!(
                "retry budget exhausted ({} failures); ending session",
                self.retries_this_turn
            );
            self.conversation
                .append(Speaker::Interviewer, EXHAUSTED_MESSAGE);
            self.conversation.set_phase(Phase::Speaking);
            self.speak(EXHAUSTED_MESSAGE).await?;
            self.conversation.set_phase(Phase::Ended);
            return Ok(true);
        }
        self.conversation.set_phase(Phase::Speaking);
        self.speak(prompt).await?;
        self.conversation.set_phase(Phase::Listening);
        Ok(false)
    }

    /// Synthesize and play one piece of interviewer speech, waiting for the
    /// output device to be fully released before returning. Synthesis and
    /// playback failures degrade to a logged skip; the transcript already
    /// holds the text.
    ///
    /// Service prompts (nudge, clarify, repeat) go through here without a
    /// transcript append on purpose: only real interviewer turns are
    /// persisted, matching the saved-log format.
    async fn speak(&mut self, text: &str) -> VoiceResult<()> {
        let started = Utc::now();
        let result = self.speak_inner(text).await;
        self.last_speech_window = Some((started, Utc::now()));
        result
    }

    async fn speak_inner(&mut self, text: &str) -> VoiceResult<()> {
        let tts = Arc::clone(&self.tts);
        let owned = text.to_string();
        let audio = match tokio::task::spawn_blocking(move || tts.synthesize(&owned))
            .await
            .map_err(|e| VoiceError::ChannelClosed(e.to_string()))?
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("synthesis failed, skipping playback: {}", e);
                return Ok(());
            }
        };

        let handle = match self.playback.start(&audio) {
            Ok(handle) => handle,
            Err(VoiceError::PlaybackBusy) => {
                // Contract violation inside the core: force-stop and retry once.
                error!("playback slot unexpectedly busy; forcing stop");
                self.playback.stop();
                match self.playback.start(&audio) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!("playback failed after forced stop: {}", e);
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                warn!("playback failed, skipping: {}", e);
                return Ok(());
            }
        };

        // Capture must not resume before this playback's audio is released.
        tokio::task::spawn_blocking(move || handle.wait())
            .await
            .map_err(|e| VoiceError::ChannelClosed(e.to_string()))?;
        Ok(())
    }

    /// Flush playback, finalize the transcript, and hand it off.
    fn finalize(self) -> VoiceResult<()> {
        self.playback.stop();
        self.conversation.set_phase(Phase::Ended);
        let snapshot = self.conversation.snapshot();
        info!("interview ended after {} turns", snapshot.turns.len());
        self.transcript_sink.persist(&snapshot.turns)?;
        Ok(())
    }
}
