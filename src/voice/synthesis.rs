//! Remote voice synthesis
//!
//! Sends `{ text, voiceId }` to the synthesis endpoint and exposes the audio
//! body as a stream of chunks so playback can begin before the download ends.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// MIME type assumed when the endpoint omits one
pub const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Markers in an error payload that indicate rate or usage limits
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "usage limit",
    "too many requests",
    "character limit",
    "credits",
];

/// Incremental audio body
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One synthesis request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Voice identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

/// Successful synthesis response, body not yet consumed
pub struct SynthesisResponse {
    /// Audio MIME type
    pub mime: String,
    /// Audio bytes as they arrive
    pub body: AudioStream,
}

impl std::fmt::Debug for SynthesisResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisResponse")
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

/// Produces synthesized audio for a text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Issue exactly one request to the synthesis endpoint
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` when the endpoint reports rate or usage
    /// limits, `SynthesisUnavailable` for any other failure status
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse>;
}

/// Error payload returned by the synthesis endpoint
///
/// Field types vary between providers, so every field stays loosely typed.
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Append the textual content of a payload field
fn push_text(parts: &mut Vec<String>, value: &serde_json::Value) {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => parts.push(s.clone()),
        serde_json::Value::Number(n) => parts.push(n.to_string()),
        serde_json::Value::Object(map) => {
            for key in ["message", "type", "code", "status", "detail"] {
                if let Some(inner) = map.get(key).filter(|v| !v.is_object()) {
                    push_text(parts, inner);
                }
            }
        }
        _ => {}
    }
}

impl ErrorPayload {
    /// Flatten every textual field into one description
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        for field in [&self.error, &self.message, &self.code].into_iter().flatten() {
            push_text(&mut parts, field);
        }
        parts.join(": ")
    }
}

/// Classify a failed synthesis response body
///
/// A decodable payload carrying a quota marker becomes `QuotaExceeded`;
/// everything else becomes `SynthesisUnavailable`.
#[must_use]
pub fn classify_failure(status: u16, body: &str) -> Error {
    let payload = serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .map(|p| p.describe())
        .filter(|d| !d.is_empty());

    let Some(description) = payload else {
        return Error::SynthesisUnavailable(format!("endpoint returned status {status}"));
    };

    let lowered = description.to_lowercase();
    if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        Error::QuotaExceeded(description)
    } else {
        Error::SynthesisUnavailable(format!("status {status}: {description}"))
    }
}

/// Synthesizes speech through an HTTP endpoint
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpSynthesizer {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint URL is empty
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::Config("synthesis URL required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url,
            api_key: config.api_key,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        tracing::debug!(
            chars = request.text.chars().count(),
            voice = ?request.voice_id,
            "requesting synthesis"
        );

        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "synthesis request failed");
            Error::SynthesisUnavailable(e.to_string())
        })?;

        let status = response.status();
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| DEFAULT_AUDIO_MIME.to_string(), ToString::to_string);

        if !status.is_success() || mime.starts_with("application/json") {
            let body = response.text().await.unwrap_or_default();
            let error = classify_failure(status.as_u16(), &body);
            tracing::error!(status = %status, error = %error, "synthesis endpoint error");
            return Err(error);
        }

        tracing::debug!(status = %status, mime = %mime, "synthesis stream opened");

        let body = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(Error::from)
            .boxed();

        Ok(SynthesisResponse { mime, body })
    }
}
