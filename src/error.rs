//! Error types for the interview voice core

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the turn-taking and audio orchestration core.
///
/// Only `Capture` is fatal to a session. `TranscriptionFailed`,
/// `GenerationFailed`, and `SynthesisFailed` are recoverable: the orchestrator
/// falls back to a spoken prompt and keeps listening. `PlaybackBusy` is a
/// contract violation inside the core and should never reach a user.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio capture failure: {0}")]
    Capture(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Response generation failed: {0}")]
    GenerationFailed(String),

    #[error("Speech synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("A playback handle is already active")]
    PlaybackBusy,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}
