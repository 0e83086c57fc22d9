//! voxloop - hands-free voice conversation client
//!
//! This library provides the real-time core of a voice chat loop:
//! - Streaming playback of synthesized speech with strategy fallback
//! - Continuous speech capture with restart policy
//! - A conversation-mode state machine that never listens while speaking
//! - Autoplay-policy recovery through a user gesture
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Coordinator                         │
//! │   idle → listening → submitting → speaking → ...    │
//! └──────┬───────────────────┬──────────────────┬───────┘
//!        │                   │                  │
//! ┌──────▼───────┐   ┌───────▼───────┐   ┌──────▼───────┐
//! │ Recognition  │   │  Completion   │   │  Playback    │
//! │ Controller   │   │  Relay        │   │  Engine      │
//! │ (capture)    │   │  (HTTP)       │   │  (sink)      │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                               │
//!                              ┌────────────────▼────────┐
//!                              │ chunked-stream →         │
//!                              │ direct-blob →            │
//!                              │ decode-buffer            │
//!                              └──────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod flags;
pub mod recognition;
pub mod voice;

pub use config::Config;
pub use conversation::{
    Command, ConversationEvent, ConversationState, Coordinator, CoordinatorHandle,
};
pub use error::{Error, Result};
pub use flags::{ListeningFlag, ModeFlag, SpeakingFlag};
pub use recognition::{RecognitionController, RecognitionUpdate};
pub use voice::{AutoplayGuard, PlaybackEngine, PlaybackReport, SessionState, Strategy};
