//! Output sink contract
//!
//! The sink is the single process-wide audio output resource. Only the
//! playback engine mutates it. Every asynchronous signal the sink raises is
//! tagged with the session it belongs to, so the engine can drop signals from
//! sessions that are no longer active.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identity token of one playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Signal raised by the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEventKind {
    /// Output actually started
    Started,
    /// Output reached the end of the loaded audio
    Ended,
    /// Output failed
    Failed(String),
}

/// Sink signal tagged with its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEvent {
    /// Session the signal belongs to
    pub session: SessionId,
    /// What happened
    pub kind: SinkEventKind,
}

impl SinkEvent {
    /// Construct an event
    #[must_use]
    pub const fn new(session: SessionId, kind: SinkEventKind) -> Self {
        Self { session, kind }
    }
}

/// Sender half the sink uses to raise events
pub type SinkEvents = mpsc::UnboundedSender<SinkEvent>;

/// A complete encoded audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// MIME type reported by the synthesis endpoint
    pub mime: String,
    /// Encoded bytes
    pub bytes: Vec<u8>,
}

impl AudioClip {
    /// Create a clip
    #[must_use]
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }
}

/// Mono PCM audio ready for output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Samples per second
    pub sample_rate: u32,
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    /// Duration in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// Sink-level failure that a different strategy may recover from
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SinkFault(pub String);

impl SinkFault {
    /// Create a fault from any message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Why the sink refused to start output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayRejection {
    /// Platform autoplay policy requires a user gesture first
    #[error("playback not allowed without a user gesture")]
    NotAllowed,
    /// Anything else (unsupported format, device failure)
    #[error("{0}")]
    Failed(String),
}

/// Audio output resource driven by the playback engine
///
/// Loading (`load_clip`, `load_decoded`, `open_stream`) replaces whatever was
/// loaded before; `release` frees the transient buffer created for a session.
#[async_trait(?Send)]
pub trait OutputSink {
    /// Receive the channel on which to raise events
    fn attach(&mut self, events: SinkEvents);

    /// Whether the chunked-media append facility exists for this MIME type
    fn supports_streaming(&self, mime: &str) -> bool;

    /// Assign a complete encoded clip (direct-blob)
    async fn load_clip(&mut self, session: SessionId, clip: &AudioClip) -> Result<(), SinkFault>;

    /// Assign already decoded PCM (decode-buffer)
    async fn load_decoded(
        &mut self,
        session: SessionId,
        audio: DecodedAudio,
    ) -> Result<(), SinkFault>;

    /// Open a streaming buffer; resolves once the buffer signals "open"
    async fn open_stream(&mut self, session: SessionId, mime: &str) -> Result<(), SinkFault>;

    /// Append one chunk; resolves once the buffer signals "update finished"
    async fn append(&mut self, chunk: &[u8]) -> Result<(), SinkFault>;

    /// Mark the streaming buffer complete
    fn end_stream(&mut self);

    /// Start output of whatever is loaded
    async fn play(&mut self) -> Result<(), PlayRejection>;

    /// Halt output and reset position
    fn stop(&mut self);

    /// Free the transient buffer held for `session`
    fn release(&mut self, session: SessionId);
}
