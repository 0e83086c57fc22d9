//! Speech recognition
//!
//! [`RecognitionController`] wraps a continuous capture primitive with the
//! restart and error policy of the conversation loop: only final results are
//! delivered, `no-speech` idles are recovered silently, and capture restarts
//! after `ended` only while conversation mode is on and nothing is playing.

mod microphone;
mod segmenter;
mod transcribe;

pub use microphone::MicrophoneCapture;
pub use segmenter::{SegmenterState, UtteranceSegmenter};
pub use transcribe::Transcriber;

use async_trait::async_trait;

use crate::flags::{ListeningFlag, ModeFlag, SpeakingFlag};
use crate::{Error, Result};

/// Error-kind strings raised by capture primitives
pub mod error_kind {
    /// Idle timeout without speech
    pub const NO_SPEECH: &str = "no-speech";
    /// Capture was stopped on request
    pub const ABORTED: &str = "aborted";
    /// Microphone access refused
    pub const NOT_ALLOWED: &str = "not-allowed";
    /// Recognition service refused
    pub const SERVICE_NOT_ALLOWED: &str = "service-not-allowed";
    /// The input device failed or went away
    pub const AUDIO_CAPTURE: &str = "audio-capture";
    /// Transcription service unreachable
    pub const NETWORK: &str = "network";
}

/// Map a capture error kind to the crate error; `None` for `aborted`
#[must_use]
pub fn capture_error(kind: &str) -> Option<Error> {
    match kind {
        error_kind::ABORTED => None,
        error_kind::NO_SPEECH => Some(Error::CaptureTransientNoSpeech),
        error_kind::NOT_ALLOWED | error_kind::SERVICE_NOT_ALLOWED => {
            Some(Error::CapturePermissionDenied)
        }
        other => Some(Error::CaptureFailed(other.to_string())),
    }
}

/// Event raised by a capture primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Capture began
    Started,
    /// Capture ended on its own
    Ended,
    /// Capture failed; `kind` is one of [`error_kind`]
    Error(String),
    /// A recognition result
    Result {
        /// Index of the utterance this result belongs to
        utterance: u64,
        /// Recognized text
        transcript: String,
        /// Whether this is the final result for the utterance
        is_final: bool,
    },
}

/// Why a capture primitive could not start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureFault {
    /// Microphone access refused
    #[error("microphone permission denied")]
    PermissionDenied,
    /// No capture facility
    #[error("capture unsupported: {0}")]
    Unsupported(String),
    /// Anything else
    #[error("{0}")]
    Failed(String),
}

impl From<CaptureFault> for Error {
    fn from(fault: CaptureFault) -> Self {
        match fault {
            CaptureFault::PermissionDenied => Self::CapturePermissionDenied,
            CaptureFault::Unsupported(reason) => Self::CaptureUnsupported(reason),
            CaptureFault::Failed(reason) => Self::CaptureFailed(reason),
        }
    }
}

/// The platform's continuous speech-capture facility
///
/// Each `start` begins a new run; events of earlier runs are never
/// delivered after it. `stop` ends the current run without an `Ended`
/// event. An `Error` event is followed by `Ended`.
#[async_trait(?Send)]
pub trait CapturePrimitive {
    /// Whether the facility exists at all
    fn is_supported(&self) -> bool;

    /// Begin a capture run
    fn start(&mut self) -> std::result::Result<(), CaptureFault>;

    /// End the current run
    fn stop(&mut self);

    /// Next event of the current run; pends while no run is active
    async fn next_event(&mut self) -> Option<CaptureEvent>;
}

/// What the controller hands to the conversation loop
#[derive(Debug)]
pub enum RecognitionUpdate {
    /// A final transcript for one utterance
    Final(String),
    /// Capture failed and listening stopped
    Error(Error),
    /// Capture ended and was not restarted
    Ended,
}

/// Wraps the capture primitive with restart and error policy
pub struct RecognitionController {
    capture: Box<dyn CapturePrimitive>,
    listening: ListeningFlag,
    mode: ModeFlag,
    speaking: SpeakingFlag,
    armed: bool,
    running: bool,
    delivered: Option<u64>,
    last_final: Option<String>,
}

impl std::fmt::Debug for RecognitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionController")
            .field("listening", &self.listening.get())
            .field("armed", &self.armed)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl RecognitionController {
    /// Create a controller that exclusively owns `capture`
    pub fn new(
        capture: impl CapturePrimitive + 'static,
        mode: ModeFlag,
        speaking: SpeakingFlag,
    ) -> Self {
        Self {
            capture: Box::new(capture),
            listening: ListeningFlag::default(),
            mode,
            speaking,
            armed: false,
            running: false,
            delivered: None,
            last_final: None,
        }
    }

    /// Start listening; a no-op while already listening
    ///
    /// # Errors
    ///
    /// Returns `CaptureUnsupported` if there is no capture facility,
    /// `CapturePermissionDenied` if microphone access is refused, or
    /// `CaptureFailed` while audio output is playing
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            tracing::trace!("start ignored, already listening");
            return Ok(());
        }
        if !self.capture.is_supported() {
            return Err(Error::CaptureUnsupported(
                "no speech capture facility on this system".to_string(),
            ));
        }

        self.armed = true;
        self.launch()
    }

    /// Stop listening; always safe
    pub fn stop(&mut self) {
        self.armed = false;
        if self.running {
            self.running = false;
            self.capture.stop();
            tracing::debug!("listening stopped");
        }
        self.listening.set(false);
    }

    /// Whether capture is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    /// Shared listening flag for synchronous reads elsewhere
    #[must_use]
    pub fn listening_flag(&self) -> ListeningFlag {
        self.listening.clone()
    }

    /// Most recent final transcript
    #[must_use]
    pub fn last_final(&self) -> Option<&str> {
        self.last_final.as_deref()
    }

    /// Wait for the next update for the conversation loop
    ///
    /// Pends forever while not listening. Cancel-safe as long as the
    /// primitive's `next_event` is.
    pub async fn next_update(&mut self) -> RecognitionUpdate {
        loop {
            if !self.running {
                std::future::pending::<()>().await;
            }

            let Some(event) = self.capture.next_event().await else {
                if let Some(update) = self.on_ended() {
                    return update;
                }
                continue;
            };

            match event {
                CaptureEvent::Started => tracing::trace!("capture run started"),
                CaptureEvent::Result {
                    utterance,
                    transcript,
                    is_final,
                } => {
                    if let Some(text) = self.on_result(utterance, transcript, is_final) {
                        return RecognitionUpdate::Final(text);
                    }
                }
                CaptureEvent::Error(kind) => {
                    if let Some(update) = self.on_error(&kind) {
                        return update;
                    }
                }
                CaptureEvent::Ended => {
                    if let Some(update) = self.on_ended() {
                        return update;
                    }
                }
            }
        }
    }

    fn launch(&mut self) -> Result<()> {
        if self.speaking.get() {
            self.armed = false;
            return Err(Error::CaptureFailed(
                "cannot listen while audio output is playing".to_string(),
            ));
        }

        if let Err(fault) = self.capture.start() {
            self.armed = false;
            self.listening.set(false);
            tracing::warn!(error = %fault, "capture failed to start");
            return Err(fault.into());
        }

        self.running = true;
        self.delivered = None;
        self.listening.set(true);
        tracing::debug!("listening started");
        Ok(())
    }

    fn on_result(&mut self, utterance: u64, transcript: String, is_final: bool) -> Option<String> {
        if !is_final {
            tracing::trace!(utterance, transcript = %transcript, "interim result");
            return None;
        }
        if self.delivered.is_some_and(|last| last >= utterance) {
            tracing::trace!(utterance, "duplicate final result ignored");
            return None;
        }

        self.delivered = Some(utterance);
        let text = transcript.trim().to_string();
        if text.is_empty() {
            tracing::debug!(utterance, "empty final result ignored");
            return None;
        }

        tracing::debug!(utterance, transcript = %text, "final transcript");
        self.last_final = Some(text.clone());
        Some(text)
    }

    fn on_error(&mut self, kind: &str) -> Option<RecognitionUpdate> {
        let Some(error) = capture_error(kind) else {
            tracing::trace!("capture aborted");
            return None;
        };

        if error.is_internal() {
            tracing::debug!(error = %error, "treating as ended");
            return self.on_ended();
        }

        tracing::warn!(kind, error = %error, "capture error");
        self.stop();
        Some(RecognitionUpdate::Error(error))
    }

    /// Apply the auto-restart policy to the end of a run
    fn on_ended(&mut self) -> Option<RecognitionUpdate> {
        self.running = false;
        self.listening.set(false);

        let restart = self.armed && self.mode.get() && !self.speaking.get();
        if !restart {
            tracing::debug!(
                armed = self.armed,
                mode = self.mode.get(),
                speaking = self.speaking.get(),
                "capture ended"
            );
            self.armed = false;
            return Some(RecognitionUpdate::Ended);
        }

        tracing::debug!("capture ended, restarting");
        match self.launch() {
            Ok(()) => None,
            Err(e) => Some(RecognitionUpdate::Error(e)),
        }
    }
}
