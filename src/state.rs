//! Conversation state: the single source of truth for the transcript, the
//! orchestrator phase, and the turn counter.
//!
//! All mutation is funneled through one lock. Critical sections only copy or
//! push; no adapter call ever runs while the lock is held. Readers get cloned
//! snapshots, never references into the guarded data, so they may observe a
//! stale phase but never a torn turn.

use crate::error::VoiceResult;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Candidate,
    Interviewer,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Candidate => write!(f, "Candidate"),
            Speaker::Interviewer => write!(f, "Interviewer"),
        }
    }
}

/// One attributed unit of transcript text.
#[derive(Debug, Clone)]
pub struct Turn {
    pub index: u64,
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Position in the listen/transcribe/generate/speak cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listening,
    Transcribing,
    Generating,
    Speaking,
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Listening => "listening",
            Phase::Transcribing => "transcribing",
            Phase::Generating => "generating",
            Phase::Speaking => "speaking",
            Phase::Ended => "ended",
        };
        write!(f, "{}", s)
    }
}

/// Consistent read of phase + transcript at one instant.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub phase: Phase,
    pub turns: Vec<Turn>,
}

#[derive(Debug)]
struct Inner {
    turns: Vec<Turn>,
    phase: Phase,
    next_index: u64,
}

/// Shared handle to the conversation state. Cloning is cheap; every clone
/// funnels through the same lock.
#[derive(Debug, Clone)]
pub struct Conversation {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                turns: Vec::new(),
                phase: Phase::Idle,
                next_index: 0,
            })),
        }
    }

    // A poisoned lock means a writer panicked mid-append; the data is still
    // structurally sound (Vec push is the last step), so recover rather than
    // propagate poisoning into every caller.
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically append a turn, assigning the next index. Returns the
    /// appended turn.
    pub fn append(&self, speaker: Speaker, text: impl Into<String>) -> Turn {
        let mut inner = self.write();
        let turn = Turn {
            index: inner.next_index,
            speaker,
            text: text.into(),
            at: Utc::now(),
        };
        inner.next_index += 1;
        inner.turns.push(turn.clone());
        debug!("turn #{} appended ({})", turn.index, turn.speaker);
        turn
    }

    /// Idempotent append keyed by turn index: an index already present (or
    /// anything but the next expected index) is a no-op. Returns whether the
    /// turn was actually appended.
    pub fn append_indexed(&self, index: u64, speaker: Speaker, text: impl Into<String>) -> bool {
        let mut inner = self.write();
        if index != inner.next_index {
            debug!(
                "duplicate/out-of-order append for turn #{} ignored (next is #{})",
                index, inner.next_index
            );
            return false;
        }
        inner.next_index += 1;
        inner.turns.push(Turn {
            index,
            speaker,
            text: text.into(),
            at: Utc::now(),
        });
        true
    }

    /// Index the next appended turn will receive.
    pub fn next_index(&self) -> u64 {
        self.read().next_index
    }

    /// Transition the phase. `Ended` is sticky: once reached, every further
    /// transition is a no-op, which makes shutdown idempotent under races.
    /// Returns the phase that was actually in effect before the call.
    pub fn set_phase(&self, phase: Phase) -> Phase {
        let mut inner = self.write();
        let previous = inner.phase;
        if previous == Phase::Ended {
            return previous;
        }
        if previous != phase {
            debug!("phase {} -> {}", previous, phase);
        }
        inner.phase = phase;
        previous
    }

    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase() == Phase::Ended
    }

    /// Consistent snapshot for front-end display.
    pub fn snapshot(&self) -> ConversationSnapshot {
        let inner = self.read();
        ConversationSnapshot {
            phase: inner.phase,
            turns: inner.turns.clone(),
        }
    }

    /// The most recent `n` turns, oldest first. Bounds the generator's
    /// context window.
    pub fn recent_turns(&self, n: usize) -> Vec<Turn> {
        let inner = self.read();
        let start = inner.turns.len().saturating_sub(n);
        inner.turns[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.read().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Does the transcribed text request the end of the interview?
///
/// Matching is deliberately a policy value, not hard-coded behavior: each
/// configured phrase matches case-insensitively as a substring of the trimmed
/// text, so "goodbye, thanks" ends the session just like a bare "goodbye".
pub fn matches_closing_phrase(text: &str, phrases: &[String]) -> bool {
    let haystack = text.trim().to_lowercase();
    if haystack.is_empty() {
        return false;
    }
    phrases
        .iter()
        .any(|phrase| haystack.contains(&phrase.to_lowercase()))
}

/// Collaborator that receives the finalized transcript when the session ends.
pub trait TranscriptSink: Send {
    fn persist(&self, turns: &[Turn]) -> VoiceResult<()>;
}

/// Writes the transcript to a timestamped text file, one line per turn.
pub struct FileTranscriptSink {
    dir: PathBuf,
}

impl FileTranscriptSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TranscriptSink for FileTranscriptSink {
    fn persist(&self, turns: &[Turn]) -> VoiceResult<()> {
        let filename = format!(
            "interview_log_{}.txt",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = self.dir.join(filename);

        let mut contents = String::from("Interview Conversation Log\n");
        contents.push_str(&"=".repeat(30));
        contents.push('\n');
        for turn in turns {
            contents.push_str(&format!("{}: {}\n", turn.speaker, turn.text));
        }

        std::fs::write(&path, contents)?;
        info!("transcript saved to {}", path.display());
        Ok(())
    }
}

/// Sink that drops the transcript. Used when persistence is not configured.
pub struct DiscardTranscriptSink;

impl TranscriptSink for DiscardTranscriptSink {
    fn persist(&self, turns: &[Turn]) -> VoiceResult<()> {
        warn!("no transcript sink configured; dropping {} turns", turns.len());
        Ok(())
    }
}
