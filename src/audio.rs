//! Microphone capture using CPAL.
//!
//! The capture source owns the input device for the process lifetime and
//! delivers fixed-size [`AudioFrame`]s over a channel. The device callback
//! never blocks: it only accumulates samples and pushes completed frames, so
//! the native capture pipeline is never stalled by downstream work.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Audio capture configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Frame size in samples (default: 480 = 30ms at 16kHz)
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 480,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame at the configured rate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

/// One fixed-size chunk of captured audio. Immutable once captured.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples (f32, normalized to -1.0..1.0), exactly one frame's worth.
    pub samples: Vec<f32>,

    /// Sample rate the frame was captured at.
    pub sample_rate: u32,

    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl AudioFrame {
    /// Duration covered by this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Microphone capture source. Holds the input device; `start` hands back the
/// live stream, which must be kept alive for capture to continue.
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> VoiceResult<Self> {
        info!(
            "Initializing audio capture ({}Hz, {} channel(s), {} samples/frame)",
            config.sample_rate, config.channels, config.frame_size
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::Capture("no input device available".to_string()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        // Probe the default config so permission/availability problems surface
        // here instead of mid-session.
        let _ = device.default_input_config()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing and deliver completed frames to `frame_tx`.
    ///
    /// Frame assembly happens inside the device callback and is O(1) per
    /// sample; anything slower belongs on the far side of the channel.
    pub fn start(self, frame_tx: mpsc::UnboundedSender<AudioFrame>) -> VoiceResult<Stream> {
        let frame_size = self.config.frame_size;
        let sample_rate = self.config.sample_rate;
        let mut pending = Vec::with_capacity(frame_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() == frame_size {
                        let frame = AudioFrame {
                            samples: std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(frame_size),
                            ),
                            sample_rate,
                            captured_at: Utc::now(),
                        };
                        if frame_tx.send(frame).is_err() {
                            // Receiver gone; the session is shutting down.
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;

        stream.play()?;
        info!("Audio capture started");

        Ok(stream)
    }

    /// List available input devices (diagnostics for capture failures).
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}
