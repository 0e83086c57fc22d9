//! Playback strategies and the payload they share
//!
//! Strategies are tried in [`Strategy::ORDER`]; each one first answers
//! whether it can be attempted given what has happened so far.

use futures::StreamExt;

use crate::voice::decode;
use crate::voice::sink::AudioClip;
use crate::voice::synthesis::{AudioStream, SynthesisResponse};
use crate::Result;

/// How a session turns bytes into sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Append chunks to a streaming buffer as they arrive; play after the first
    ChunkedStream,
    /// Wait for the whole body, hand the sink one playable clip
    DirectBlob,
    /// Decode to PCM ourselves and play the samples
    DecodeBuffer,
}

impl Strategy {
    /// Fallback order
    pub const ORDER: [Self; 3] = [Self::ChunkedStream, Self::DirectBlob, Self::DecodeBuffer];

    /// Whether this strategy may be attempted
    #[must_use]
    pub fn can_attempt(self, ctx: &AttemptContext, payload: &Payload) -> bool {
        match self {
            Self::ChunkedStream => {
                !ctx.short_text() && ctx.streaming_supported && payload.is_untouched()
            }
            Self::DirectBlob => true,
            Self::DecodeBuffer => ctx.decodable,
        }
    }

    /// Stable name for logs and reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChunkedStream => "chunked-stream",
            Self::DirectBlob => "direct-blob",
            Self::DecodeBuffer => "decode-buffer",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts the strategy predicates depend on
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Characters in the text being spoken
    pub text_chars: usize,
    /// Short-text threshold in characters
    pub short_text_chars: usize,
    /// Whether the sink can append chunks for this MIME type
    pub streaming_supported: bool,
    /// Whether the low-level decoder understands the payload
    pub decodable: bool,
}

impl AttemptContext {
    /// Text is below the short-text threshold
    #[must_use]
    pub const fn short_text(&self) -> bool {
        self.text_chars < self.short_text_chars
    }
}

/// The one network response of a session, readable incrementally
///
/// Every chunk read is also kept, so a fallback strategy replays the
/// already-read prefix followed by the rest of the same body.
pub struct Payload {
    mime: String,
    received: Vec<u8>,
    body: Option<AudioStream>,
}

impl Payload {
    /// Wrap a fresh synthesis response
    #[must_use]
    pub fn from_response(response: SynthesisResponse) -> Self {
        Self {
            mime: response.mime,
            received: Vec::new(),
            body: Some(response.body),
        }
    }

    /// Wrap bytes that were downloaded earlier
    #[must_use]
    pub fn from_clip(clip: AudioClip) -> Self {
        Self {
            mime: clip.mime,
            received: clip.bytes,
            body: None,
        }
    }

    /// Audio MIME type
    #[must_use]
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// Bytes received so far
    #[must_use]
    pub fn bytes_received(&self) -> usize {
        self.received.len()
    }

    /// Nothing has been read yet and the body is still live
    #[must_use]
    pub fn is_untouched(&self) -> bool {
        self.body.is_some() && self.received.is_empty()
    }

    /// Pull the next chunk from the network, in arrival order
    ///
    /// # Errors
    ///
    /// Returns error if the body fails mid-stream
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };

        loop {
            match body.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => {
                    self.received.extend_from_slice(&chunk);
                    tracing::trace!(chunk = chunk.len(), total = self.received.len(), "chunk received");
                    return Ok(Some(chunk));
                }
                Some(Err(e)) => {
                    self.body = None;
                    return Err(e);
                }
                None => {
                    self.body = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Drain the remaining body and return the whole payload
    ///
    /// # Errors
    ///
    /// Returns error if the body fails mid-stream
    pub async fn collect(&mut self) -> Result<AudioClip> {
        while self.next_chunk().await?.is_some() {}
        Ok(self.snapshot())
    }

    /// Everything received so far as a clip
    #[must_use]
    pub fn snapshot(&self) -> AudioClip {
        AudioClip::new(self.mime.clone(), self.received.clone())
    }

    /// Whether the low-level decoder could play this payload
    #[must_use]
    pub fn decodable(&self) -> bool {
        decode::can_decode(&AudioClip::new(
            self.mime.clone(),
            self.received.iter().take(16).copied().collect(),
        ))
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("mime", &self.mime)
            .field("received", &self.received.len())
            .field("live", &self.body.is_some())
            .finish()
    }
}
