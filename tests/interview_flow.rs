//! End-to-end tests for the interview phase machine, driven by synthetic
//! utterances and scripted adapters. No audio hardware required.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use viva_voce::{
    InterviewConfig, InterviewOrchestrator, Phase, ResponseGenerator, ScriptedGenerator,
    ScriptedStt, SilentTts, Speaker, SttBackend, TtsBackend, Turn, Utterance, VoiceError,
    VoiceResult,
};

fn utterance(seq: u64) -> Utterance {
    let samples = vec![0.3f32; 16000]; // 1s at 16kHz
    Utterance {
        seq,
        sample_rate: 16000,
        duration: Duration::from_secs(1),
        sealed_at: Utc::now(),
        samples,
    }
}

fn test_config() -> InterviewConfig {
    let mut config = InterviewConfig::default();
    config.session.silence_nudge_secs = 1;
    config
}

/// STT that always fails, for the retry-budget path.
struct FailingStt;

impl SttBackend for FailingStt {
    fn transcribe(&self, _utterance: &Utterance) -> VoiceResult<String> {
        Err(VoiceError::TranscriptionFailed("model offline".to_string()))
    }
}

/// Generator that always fails.
struct FailingGenerator;

impl ResponseGenerator for FailingGenerator {
    fn opening(&self) -> VoiceResult<String> {
        Ok("Welcome!".to_string())
    }

    fn reply(&self, _history: &[Turn], _candidate_text: &str) -> VoiceResult<String> {
        Err(VoiceError::GenerationFailed("model offline".to_string()))
    }
}

/// TTS that always fails, for the text-before-audio guarantee.
struct FailingTts;

impl TtsBackend for FailingTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Err(VoiceError::SynthesisFailed("no voice".to_string()))
    }
}

/// TTS that takes a while, holding the session in the speaking phase.
struct SlowTts {
    delay: Duration,
}

impl TtsBackend for SlowTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn full_interview_reaches_ended_via_closing_phrase() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines(["tell me about arrays", "goodbye"])),
        Arc::new(ScriptedGenerator::with_replies([
            "Sure - what is the complexity of indexing into an array?",
        ])),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    tx.send(utterance(0)).await.unwrap();
    tx.send(utterance(1)).await.unwrap();

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("session should succeed");

    let snapshot = conversation.snapshot();
    assert_eq!(snapshot.phase, Phase::Ended);

    let turns = &snapshot.turns;
    assert_eq!(turns.len(), 5);
    assert_eq!(turns[0].speaker, Speaker::Interviewer); // opening
    assert_eq!(turns[1].speaker, Speaker::Candidate);
    assert_eq!(turns[1].text, "tell me about arrays");
    assert_eq!(turns[2].speaker, Speaker::Interviewer);
    assert!(turns[2].text.contains("complexity"));
    assert_eq!(turns[3].speaker, Speaker::Candidate);
    assert_eq!(turns[3].text, "goodbye");
    assert_eq!(turns[4].speaker, Speaker::Interviewer); // farewell

    // Turns alternate strictly after the opening.
    for pair in turns[1..].windows(2) {
        assert_ne!(pair[0].speaker, pair[1].speaker);
    }
    // Indices are dense and increasing.
    for (i, turn) in turns.iter().enumerate() {
        assert_eq!(turn.index, i as u64);
    }
}

#[tokio::test]
async fn reply_text_survives_synthesis_failure() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines(["tell me about arrays"])),
        Arc::new(ScriptedGenerator::with_replies(["Arrays are contiguous."])),
        Arc::new(FailingTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    tx.send(utterance(0)).await.unwrap();
    drop(tx); // channel closes after the one utterance

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("voice failure must not kill the session");

    let snapshot = conversation.snapshot();
    assert_eq!(snapshot.phase, Phase::Ended);
    // The interviewer turn was appended before synthesis was attempted.
    let reply = snapshot
        .turns
        .iter()
        .find(|t| t.text == "Arrays are contiguous.")
        .expect("reply text must be in the transcript");
    assert_eq!(reply.speaker, Speaker::Interviewer);
}

#[tokio::test]
async fn empty_transcription_appends_no_candidate_turn() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines([""])),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    tx.send(utterance(0)).await.unwrap();
    drop(tx);

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("session should succeed");

    let snapshot = conversation.snapshot();
    // Only the opening made it into the transcript; the unintelligible
    // utterance produced a spoken clarification, not a turn.
    assert_eq!(snapshot.turns.len(), 1);
    assert_eq!(snapshot.turns[0].speaker, Speaker::Interviewer);
}

#[tokio::test]
async fn exhausted_retries_end_the_session_gracefully() {
    let mut config = test_config();
    config.session.max_retries_per_turn = 1;

    let orch = InterviewOrchestrator::new(
        config,
        Arc::new(FailingStt),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    for seq in 0..3 {
        tx.send(utterance(seq)).await.unwrap();
    }

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("exhaustion must end gracefully, not error");

    let snapshot = conversation.snapshot();
    assert_eq!(snapshot.phase, Phase::Ended);
    // No candidate turn ever made it in; the last turn is the sign-off.
    assert!(snapshot.turns.iter().all(|t| t.speaker == Speaker::Interviewer));
    assert!(snapshot
        .turns
        .last()
        .expect("at least the opening")
        .text
        .contains("Thank you for your time"));
}

#[tokio::test]
async fn generation_failure_keeps_candidate_turn_and_recovers() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines(["tell me about arrays"])),
        Arc::new(FailingGenerator),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    tx.send(utterance(0)).await.unwrap();
    drop(tx);

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("generation failure is recoverable");

    let snapshot = conversation.snapshot();
    let candidate: Vec<_> = snapshot
        .turns
        .iter()
        .filter(|t| t.speaker == Speaker::Candidate)
        .collect();
    assert_eq!(candidate.len(), 1);
    assert_eq!(candidate[0].text, "tell me about arrays");
}

#[tokio::test]
async fn utterance_sealed_during_interviewer_speech_is_dropped() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines(["this text must never appear"])),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(SlowTts {
            delay: Duration::from_millis(400),
        }),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    let sender = tokio::spawn(async move {
        // Seal an utterance midway through the opening synthesis: it is the
        // interviewer's own audio picked up by the mic.
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(utterance(0)).await.unwrap();
    });

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("session should succeed");
    sender.await.unwrap();

    let snapshot = conversation.snapshot();
    // The echo never became a candidate turn and was never transcribed.
    assert!(snapshot
        .turns
        .iter()
        .all(|t| t.speaker == Speaker::Interviewer));
    assert!(snapshot
        .turns
        .iter()
        .all(|t| t.text != "this text must never appear"));
}

#[tokio::test]
async fn persistent_generation_failure_exhausts_the_retry_budget() {
    let mut config = test_config();
    config.session.max_retries_per_turn = 2;

    let orch = InterviewOrchestrator::new(
        config,
        Arc::new(ScriptedStt::with_lines([
            "answer one",
            "answer two",
            "answer three",
            "answer four",
            "answer five",
            "answer six",
        ])),
        Arc::new(FailingGenerator),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    for seq in 0..6 {
        tx.send(utterance(seq)).await.unwrap();
    }

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("exhaustion must end gracefully, not error");

    let snapshot = conversation.snapshot();
    assert_eq!(snapshot.phase, Phase::Ended);
    // A budget of 2 tolerates two failed cycles; the third ends the session,
    // however many utterances are still queued.
    let candidate = snapshot
        .turns
        .iter()
        .filter(|t| t.speaker == Speaker::Candidate)
        .count();
    assert_eq!(candidate, 3);
    assert!(snapshot
        .turns
        .last()
        .expect("at least the opening")
        .text
        .contains("Thank you for your time"));
}

#[tokio::test]
async fn request_stop_ends_a_quiet_session() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::new()),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();
    let control = orch.control();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.request_stop();
    });

    let (_tx, rx) = mpsc::channel(16);
    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("stop request must end the session")
        .expect("session should succeed");
    stopper.await.unwrap();

    assert_eq!(conversation.phase(), Phase::Ended);
    // The transcript still holds the opening and never shrank.
    assert!(!conversation.snapshot().turns.is_empty());
}

#[tokio::test]
async fn stale_utterance_seq_is_never_transcribed_twice() {
    let orch = InterviewOrchestrator::new(
        test_config(),
        Arc::new(ScriptedStt::with_lines([
            "tell me about arrays",
            "this line must never be used",
        ])),
        Arc::new(ScriptedGenerator::with_replies(["Go on."])),
        Arc::new(SilentTts),
    )
    .unwrap();
    let conversation = orch.conversation();

    let (tx, rx) = mpsc::channel(16);
    tx.send(utterance(0)).await.unwrap();
    tx.send(utterance(0)).await.unwrap(); // duplicate seq
    drop(tx);

    timeout(Duration::from_secs(5), orch.run(rx))
        .await
        .expect("session should finish")
        .expect("session should succeed");

    let snapshot = conversation.snapshot();
    let candidate: Vec<_> = snapshot
        .turns
        .iter()
        .filter(|t| t.speaker == Speaker::Candidate)
        .collect();
    assert_eq!(candidate.len(), 1);
    assert!(snapshot
        .turns
        .iter()
        .all(|t| t.text != "this line must never be used"));
}
