//! Capture primitive backed by the default input device
//!
//! Audio is segmented into utterances locally and each utterance is sent to
//! the transcription endpoint; the result arrives as one final result.

use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::segmenter::UtteranceSegmenter;
use super::transcribe::Transcriber;
use super::{CaptureEvent, CaptureFault, CapturePrimitive, error_kind};
use crate::config::RecognitionConfig;
use crate::voice::decode::samples_to_wav;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Captures speech from the default input device
pub struct MicrophoneCapture {
    transcriber: Arc<Transcriber>,
    energy_threshold: f32,
    no_speech_timeout: Duration,
    stream: Option<Stream>,
    worker: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
}

impl MicrophoneCapture {
    /// Create a capture primitive; the device is opened on `start`
    #[must_use]
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            transcriber: Arc::new(Transcriber::new(config)),
            energy_threshold: config.energy_threshold,
            no_speech_timeout: config.no_speech_timeout,
            stream: None,
            worker: None,
            events: None,
        }
    }

    fn open_stream(
        samples: mpsc::UnboundedSender<Vec<f32>>,
    ) -> std::result::Result<Stream, CaptureFault> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureFault::Unsupported("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| CaptureFault::Failed(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| CaptureFault::Unsupported("no suitable audio config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = samples.send(data.to_vec());
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| CaptureFault::Failed(e.to_string()))?;
        Ok(stream)
    }
}

impl std::fmt::Debug for MicrophoneCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneCapture")
            .field("transcriber", &self.transcriber)
            .field("capturing", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait(?Send)]
impl CapturePrimitive for MicrophoneCapture {
    fn is_supported(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&mut self) -> std::result::Result<(), CaptureFault> {
        self.stop();

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.stream = Some(Self::open_stream(samples_tx)?);
        self.worker = Some(tokio::spawn(run_capture(
            samples_rx,
            UtteranceSegmenter::new(self.energy_threshold),
            Arc::clone(&self.transcriber),
            events_tx,
            self.no_speech_timeout,
        )));
        self.events = Some(events_rx);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.events = None;
        if self.stream.take().is_some() {
            tracing::debug!("audio capture stopped");
        }
    }

    async fn next_event(&mut self) -> Option<CaptureEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Segment, transcribe, and report one capture run
async fn run_capture(
    mut samples: mpsc::UnboundedReceiver<Vec<f32>>,
    mut segmenter: UtteranceSegmenter,
    transcriber: Arc<Transcriber>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    no_speech_timeout: Duration,
) {
    let _ = events.send(CaptureEvent::Started);
    let mut deadline = Instant::now() + no_speech_timeout;
    let mut utterance = 0u64;

    loop {
        let chunk = match tokio::time::timeout_at(deadline, samples.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                let _ = events.send(CaptureEvent::Error(error_kind::AUDIO_CAPTURE.to_string()));
                break;
            }
            Err(_) if segmenter.in_speech() => {
                deadline = Instant::now() + no_speech_timeout;
                continue;
            }
            Err(_) => {
                let _ = events.send(CaptureEvent::Error(error_kind::NO_SPEECH.to_string()));
                break;
            }
        };

        let Some(segment) = segmenter.push(&chunk) else {
            if segmenter.in_speech() {
                deadline = Instant::now() + no_speech_timeout;
            }
            continue;
        };

        utterance += 1;
        let wav = match samples_to_wav(&segment, SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode utterance");
                continue;
            }
        };

        match transcriber.transcribe(&wav).await {
            Ok(transcript) => {
                let _ = events.send(CaptureEvent::Result {
                    utterance,
                    transcript,
                    is_final: true,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                let _ = events.send(CaptureEvent::Error(error_kind::NETWORK.to_string()));
                break;
            }
        }

        // Audio captured during transcription belongs to the next utterance
        deadline = Instant::now() + no_speech_timeout;
    }

    let _ = events.send(CaptureEvent::Ended);
}

fn map_build_error(error: BuildStreamError) -> CaptureFault {
    match error {
        BuildStreamError::DeviceNotAvailable => {
            CaptureFault::Unsupported("input device not available".to_string())
        }
        BuildStreamError::BackendSpecific { err } => {
            let description = err.description.to_lowercase();
            if description.contains("permission") || description.contains("denied") {
                CaptureFault::PermissionDenied
            } else {
                CaptureFault::Failed(err.description)
            }
        }
        other => CaptureFault::Failed(other.to_string()),
    }
}
