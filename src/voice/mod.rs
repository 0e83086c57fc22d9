//! Voice output
//!
//! Synthesis requests, the output sink contract, playback strategies, and the
//! engine that ties them together.

pub mod autoplay;
pub mod decode;
mod device;
mod engine;
pub mod sink;
pub mod strategy;
pub mod synthesis;
pub mod text;

pub use autoplay::AutoplayGuard;
pub use device::DeviceSink;
pub use engine::{PlaybackEngine, PlaybackReport, PlaybackSession, SessionState};
pub use sink::{
    AudioClip, DecodedAudio, OutputSink, PlayRejection, SessionId, SinkEvent, SinkEventKind,
    SinkEvents, SinkFault,
};
pub use strategy::Strategy;
pub use synthesis::{HttpSynthesizer, SynthesisRequest, SynthesisResponse, Synthesizer};
