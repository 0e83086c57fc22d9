//! Error types for voxloop

use thiserror::Error;

/// Result type alias for voxloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform refused microphone access
    #[error("microphone permission denied: allow microphone access to use voice input")]
    CapturePermissionDenied,

    /// No speech capture facility is available
    #[error("speech capture unsupported: {0}")]
    CaptureUnsupported(String),

    /// Capture timed out without hearing speech (recovered internally)
    #[error("no speech detected")]
    CaptureTransientNoSpeech,

    /// Capture failed for a reason other than permission or idle timeout
    #[error("speech capture failed: {0}")]
    CaptureFailed(String),

    /// The synthesis endpoint could not produce audio
    #[error("voice synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    /// The synthesis endpoint rejected the request for rate or usage limits
    #[error("voice budget exhausted: {0}; shorten the reply or turn voice off")]
    QuotaExceeded(String),

    /// The platform rejected programmatic playback start; the session is queued
    #[error("playback blocked until the next user gesture")]
    PlaybackBlocked,

    /// Streaming buffer failed (recovered internally by strategy fallback)
    #[error("streaming buffer fault: {0}")]
    StreamingBufferFault(String),

    /// Audio device or decode error
    #[error("audio error: {0}")]
    Audio(String),

    /// Completion relay error
    #[error("relay error: {0}")]
    Relay(String),

    /// Message store error
    #[error("message store error: {0}")]
    Store(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is recovered locally and must never reach the UI
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::CaptureTransientNoSpeech | Self::StreamingBufferFault(_)
        )
    }
}
