//! Configuration management for voxloop

pub mod file;

use std::time::Duration;

use secrecy::SecretString;

use self::file::VoxloopConfigFile;
use crate::{Error, Result};

/// Default synthesis endpoint
const DEFAULT_SYNTHESIS_URL: &str = "http://localhost:3000/api/tts";

/// Default completion relay endpoint
const DEFAULT_RELAY_URL: &str = "http://localhost:3000/api/chat";

/// Default transcription endpoint (whisper-compatible)
const DEFAULT_STT_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Texts shorter than this many characters skip the streaming path
pub const DEFAULT_SHORT_TEXT_CHARS: usize = 160;

/// Bounded wait for the streaming buffer "open" signal
pub const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// voxloop configuration
#[derive(Debug)]
pub struct Config {
    /// Synthesis endpoint configuration
    pub synthesis: SynthesisConfig,

    /// Playback engine configuration
    pub playback: PlaybackConfig,

    /// Capture and transcription configuration
    pub recognition: RecognitionConfig,

    /// Completion relay URL
    pub relay_url: String,

    /// Start with conversation mode enabled
    pub conversation_mode: bool,
}

/// Remote voice-synthesis endpoint
#[derive(Debug)]
pub struct SynthesisConfig {
    /// Endpoint URL
    pub url: String,

    /// Optional bearer token
    pub api_key: Option<SecretString>,

    /// Voice identifier sent with each request
    pub voice_id: Option<String>,
}

/// Playback engine settings, owned by the caller and passed to the engine
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Audio output enabled; when false `speak` resolves without output
    pub enabled: bool,

    /// Character count below which direct-blob playback is always used
    pub short_text_chars: usize,

    /// Bounded wait for the streaming buffer to open
    pub stream_open_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            short_text_chars: DEFAULT_SHORT_TEXT_CHARS,
            stream_open_timeout: DEFAULT_STREAM_OPEN_TIMEOUT,
        }
    }
}

/// Microphone capture and transcription settings
#[derive(Debug)]
pub struct RecognitionConfig {
    /// Transcription endpoint
    pub stt_url: String,

    /// Transcription model
    pub stt_model: String,

    /// Transcription API key
    pub api_key: Option<SecretString>,

    /// Idle time before a `no-speech` timeout
    pub no_speech_timeout: Duration,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            stt_url: DEFAULT_STT_URL.to_string(),
            stt_model: "whisper-1".to_string(),
            api_key: None,
            no_speech_timeout: Duration::from_secs(8),
            energy_threshold: 0.03,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the optional config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration with precedence env > toml > default
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn resolve(fc: VoxloopConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let synthesis = SynthesisConfig {
            url: env("VOXLOOP_SYNTHESIS_URL")
                .or(fc.synthesis.url)
                .unwrap_or_else(|| DEFAULT_SYNTHESIS_URL.to_string()),
            api_key: env("VOXLOOP_API_KEY")
                .or(fc.synthesis.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            voice_id: env("VOXLOOP_VOICE_ID")
                .or(fc.synthesis.voice_id)
                .filter(|v| !v.is_empty()),
        };

        let playback_defaults = PlaybackConfig::default();
        let playback = PlaybackConfig {
            enabled: parse_env(&env, "VOXLOOP_AUDIO_ENABLED")?
                .or(fc.playback.enabled)
                .unwrap_or(playback_defaults.enabled),
            short_text_chars: parse_env(&env, "VOXLOOP_SHORT_TEXT_CHARS")?
                .or(fc.playback.short_text_chars)
                .unwrap_or(playback_defaults.short_text_chars),
            stream_open_timeout: parse_env(&env, "VOXLOOP_STREAM_OPEN_TIMEOUT_MS")?
                .or(fc.playback.stream_open_timeout_ms)
                .map_or(playback_defaults.stream_open_timeout, Duration::from_millis),
        };

        let recognition_defaults = RecognitionConfig::default();
        let recognition = RecognitionConfig {
            stt_url: env("VOXLOOP_STT_URL")
                .or(fc.recognition.stt_url)
                .unwrap_or(recognition_defaults.stt_url),
            stt_model: env("VOXLOOP_STT_MODEL")
                .or(fc.recognition.stt_model)
                .unwrap_or(recognition_defaults.stt_model),
            api_key: env("OPENAI_API_KEY")
                .or(fc.recognition.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            no_speech_timeout: parse_env(&env, "VOXLOOP_NO_SPEECH_SECS")?
                .or(fc.recognition.no_speech_secs)
                .map_or(recognition_defaults.no_speech_timeout, Duration::from_secs),
            energy_threshold: fc
                .recognition
                .energy_threshold
                .unwrap_or(recognition_defaults.energy_threshold),
        };

        if playback.short_text_chars == 0 {
            tracing::debug!("short-text threshold is 0, every reply will try streaming");
        }

        Ok(Self {
            synthesis,
            playback,
            recognition,
            relay_url: env("VOXLOOP_RELAY_URL")
                .or(fc.conversation.relay_url)
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            conversation_mode: parse_env(&env, "VOXLOOP_CONVERSATION_MODE")?
                .or(fc.conversation.conversation_mode)
                .unwrap_or(false),
        })
    }
}

/// Parse an optional environment value, rejecting malformed input
fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}")))
        })
        .transpose()
}
