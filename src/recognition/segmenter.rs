//! Energy-based utterance segmentation
//!
//! Splits a continuous 16 kHz sample stream into utterances: a run of
//! speech followed by enough silence.

/// Minimum duration of speech for an utterance (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration that ends an utterance (in samples)
const SILENCE_SAMPLES: usize = 12_000; // 0.75 seconds

/// Hard cap on one utterance
const MAX_UTTERANCE_SAMPLES: usize = 16_000 * 30;

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Accumulating an utterance
    Speech,
}

/// Detects utterance boundaries in captured audio
#[derive(Debug)]
pub struct UtteranceSegmenter {
    threshold: f32,
    state: SegmenterState,
    buffer: Vec<f32>,
    voiced: usize,
    silence: usize,
}

impl UtteranceSegmenter {
    /// Create a segmenter that treats RMS energy above `threshold` as speech
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        tracing::debug!(threshold, "utterance segmenter initialized");

        Self {
            threshold,
            state: SegmenterState::Idle,
            buffer: Vec::new(),
            voiced: 0,
            silence: 0,
        }
    }

    /// Feed captured samples; returns a complete utterance when one ends
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Speech;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.voiced = samples.len();
                    self.silence = 0;
                    tracing::trace!(energy, "speech detected");
                }
                None
            }
            SegmenterState::Speech => {
                self.buffer.extend_from_slice(samples);
                if is_speech {
                    self.voiced += samples.len();
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                if self.silence > SILENCE_SAMPLES || self.buffer.len() >= MAX_UTTERANCE_SAMPLES {
                    if self.voiced >= MIN_SPEECH_SAMPLES {
                        tracing::debug!(samples = self.buffer.len(), "utterance complete");
                        let utterance = std::mem::take(&mut self.buffer);
                        self.reset();
                        return Some(utterance);
                    }

                    // Too short to be speech: a click or a cough
                    tracing::trace!(voiced = self.voiced, "discarding short noise burst");
                    self.reset();
                }
                None
            }
        }
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.state == SegmenterState::Speech
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.clear();
        self.voiced = 0;
        self.silence = 0;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
