//! CLI front end for the spoken interview agent.
//!
//! Reads configuration from the environment (`.env` supported), wires the
//! best available STT/LLM/TTS backends, and runs a live microphone session.
//! Ctrl-C triggers the interrupt path (`request_stop`); the transcript lands
//! in a timestamped log file in the working directory.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use viva_voce::{
    create_best_generator, create_best_stt, create_best_tts, AudioCapture, FileTranscriptSink,
    InterviewConfig, InterviewOrchestrator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = InterviewConfig::default();

    match AudioCapture::list_input_devices() {
        Ok(devices) if !devices.is_empty() => info!("input devices: {:?}", devices),
        _ => info!("no input devices enumerated; capture may fail"),
    }

    let stt = Arc::from(create_best_stt());
    let generator = Arc::from(create_best_generator(config.generator.clone()));
    let tts = Arc::from(create_best_tts());

    let orchestrator = InterviewOrchestrator::new(config, stt, generator, tts)
        .context("orchestrator setup failed")?
        .with_transcript_sink(Box::new(FileTranscriptSink::new(".")));

    let control = orchestrator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping interview");
            control.request_stop();
        }
    });

    info!("Say 'goodbye' or 'thank you' to end the interview.");
    orchestrator
        .run_with_mic()
        .await
        .context("interview session failed")?;

    Ok(())
}
