//! Hardware-dependent capture tests.
//!
//! Note: these require a working microphone and may not run in CI
//! environments; they are ignored by default.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use viva_voce::{
    AudioCapture, AudioConfig, SegmentEvent, SegmenterConfig, VoiceSegmenter, WebRtcClassifier,
};

#[tokio::test]
#[ignore] // Requires audio hardware and manual speech
async fn mic_capture_seals_an_utterance() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    println!("\nSpeech Detection Test");
    println!("=====================");
    println!("Please speak into your microphone within 10 seconds...\n");

    let audio = AudioConfig::default();
    let capture = AudioCapture::new(audio.clone()).expect("Failed to open capture");
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let _stream = capture.start(frame_tx).expect("Failed to start capture");

    let seg_config = SegmenterConfig::default();
    let classifier = WebRtcClassifier::new(
        audio.sample_rate,
        seg_config.aggressiveness,
        audio.frame_size,
    )
    .expect("Failed to build VAD");
    let mut segmenter = VoiceSegmenter::new(seg_config, Box::new(classifier));

    let result = timeout(Duration::from_secs(10), async {
        while let Some(frame) = frame_rx.recv().await {
            match segmenter.observe(&frame).expect("segmenter error") {
                Some(SegmentEvent::SpeechStarted) => println!("Speech detected!"),
                Some(SegmentEvent::SpeechEnded(utterance)) => return Some(utterance),
                _ => {}
            }
        }
        None
    })
    .await;

    match result {
        Ok(Some(utterance)) => {
            println!(
                "Utterance sealed: {:.1}s, {} samples",
                utterance.duration.as_secs_f32(),
                utterance.samples.len()
            );
            assert!(!utterance.samples.is_empty());
            assert_eq!(utterance.seq, 0);
        }
        Ok(None) => panic!("capture channel closed unexpectedly"),
        Err(_) => {
            println!("Timeout - no speech detected within 10 seconds.");
            println!("This is expected if you didn't speak into the microphone.");
        }
    }
}
