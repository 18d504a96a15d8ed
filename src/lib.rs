//! # viva-voce — spoken technical interview core
//!
//! Real-time turn-taking and audio orchestration for a voice interview agent:
//! listen to the candidate, transcribe, generate a reply, speak it back, and
//! keep one conversation state consistent across capture, inference, and
//! playback, with no overlapping speech and no duplicated turns.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Turn Orchestrator                         │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────────┐     │
//! │  │  Audio In  │→ │  Segmenter  │→ │  STT → LLM → TTS   │     │
//! │  │   (cpal)   │  │ (VAD + gap) │  │  (spawn_blocking)  │     │
//! │  └────────────┘  └─────────────┘  └────────────────────┘     │
//! │        ↓                ↓                    ↓                │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────────┐     │
//! │  │ Audio Out  │← │ Conversation│← │  Playback (rodio,  │     │
//! │  │  (rodio)   │  │   (1 lock)  │  │  single-slot gate) │     │
//! │  └────────────┘  └─────────────┘  └────────────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The STT, LLM, and TTS backends are narrow trait boundaries; production
//! implementations speak OpenAI-compatible APIs (plus optional local Whisper
//! behind the `whisper` feature) and scripted stand-ins drive tests.

pub mod audio;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod playback;
pub mod segmenter;
pub mod state;
pub mod stt;
pub mod vad;

pub use audio::{AudioCapture, AudioConfig, AudioFrame};
pub use error::{VoiceError, VoiceResult};
pub use generator::{
    create_best_generator, GeneratorConfig, OpenAiGenerator, ResponseGenerator, ScriptedGenerator,
};
pub use orchestrator::{InterviewConfig, InterviewOrchestrator, SessionConfig, SessionControl};
pub use playback::{
    create_best_tts, OpenAiTts, PlaybackController, PlaybackHandle, PlaybackRemote, SilentTts,
    TtsBackend,
};
pub use segmenter::{SegmentEvent, SegmenterConfig, Utterance, VoiceSegmenter};
pub use state::{
    matches_closing_phrase, Conversation, ConversationSnapshot, FileTranscriptSink, Phase, Speaker,
    TranscriptSink, Turn,
};
pub use stt::{create_best_stt, OpenAiStt, ScriptedStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use vad::{EnergyClassifier, FrameClassifier, WebRtcClassifier};
