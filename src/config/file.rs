//! TOML configuration file loading
//!
//! Supports `~/.config/voxloop/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxloopConfigFile {
    /// Speech synthesis endpoint
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Audio output behavior
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Speech capture and transcription
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Completion relay and conversation loop
    #[serde(default)]
    pub conversation: ConversationFileConfig,
}

/// Synthesis endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// Endpoint URL accepting `{ text, voiceId }`
    pub url: Option<String>,

    /// Bearer token for the endpoint
    pub api_key: Option<String>,

    /// Default voice identifier
    pub voice_id: Option<String>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Enable audio output
    pub enabled: Option<bool>,

    /// Texts shorter than this (in characters) always use direct-blob playback
    pub short_text_chars: Option<usize>,

    /// Maximum wait for the streaming buffer to open, in milliseconds
    pub stream_open_timeout_ms: Option<u64>,
}

/// Recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// Whisper-compatible transcription endpoint
    pub stt_url: Option<String>,

    /// Transcription model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// API key for the transcription endpoint
    pub api_key: Option<String>,

    /// Seconds of silence before a `no-speech` timeout
    pub no_speech_secs: Option<u64>,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: Option<f32>,
}

/// Conversation loop configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Completion relay URL
    pub relay_url: Option<String>,

    /// Start with hands-free conversation mode enabled
    pub conversation_mode: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoxloopConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoxloopConfigFile {
    config_file_path().map_or_else(VoxloopConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> VoxloopConfigFile {
    if !path.exists() {
        return VoxloopConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxloopConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxloopConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voxloop/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxloop").join("config.toml"))
}
