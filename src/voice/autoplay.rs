//! Autoplay-policy guard
//!
//! Tracks whether the platform refused programmatic playback and performs the
//! silent-audio unlock on the next user gesture.

use std::sync::Arc;

use tokio::sync::watch;

use crate::voice::decode::samples_to_wav;
use crate::voice::sink::{AudioClip, OutputSink, PlayRejection, SessionId};
use crate::{Error, Result};

/// Sample rate of the silent unlock asset
const SILENT_SAMPLE_RATE: u32 = 8000;

/// Length of the silent unlock asset in samples (100 ms)
const SILENT_SAMPLES: usize = 800;

/// Exposes the blocked state and a "became blocked" subscription
#[derive(Debug, Clone)]
pub struct AutoplayGuard {
    blocked: Arc<watch::Sender<bool>>,
}

impl Default for AutoplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoplayGuard {
    /// Create an unblocked guard
    #[must_use]
    pub fn new() -> Self {
        let (blocked, _) = watch::channel(false);
        Self {
            blocked: Arc::new(blocked),
        }
    }

    /// Whether playback is currently blocked by platform policy
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        *self.blocked.borrow()
    }

    /// Subscribe to blocked-state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.blocked.subscribe()
    }

    /// Record a policy rejection
    pub fn mark_blocked(&self) {
        let changed = self.blocked.send_if_modified(|blocked| {
            let was = *blocked;
            *blocked = true;
            !was
        });
        if changed {
            tracing::warn!("playback blocked by autoplay policy, waiting for a user gesture");
        }
    }

    /// Clear the blocked state
    pub fn clear(&self) {
        let changed = self.blocked.send_if_modified(|blocked| {
            let was = *blocked;
            *blocked = false;
            was
        });
        if changed {
            tracing::info!("autoplay unlocked");
        }
    }

    /// Play the silent asset through `sink`; clears the blocked flag on success
    ///
    /// Must be called from a user-gesture context.
    ///
    /// # Errors
    ///
    /// Returns `PlaybackBlocked` if the platform still refuses playback, or an
    /// audio error if the sink cannot play the asset at all
    pub async fn unlock(&self, sink: &mut dyn OutputSink, session: SessionId) -> Result<()> {
        let clip = silent_clip()?;

        let outcome = match sink.load_clip(session, &clip).await {
            Ok(()) => sink.play().await,
            Err(fault) => Err(PlayRejection::Failed(fault.0)),
        };
        sink.stop();
        sink.release(session);

        match outcome {
            Ok(()) => {
                self.clear();
                Ok(())
            }
            Err(PlayRejection::NotAllowed) => {
                self.mark_blocked();
                Err(Error::PlaybackBlocked)
            }
            Err(PlayRejection::Failed(reason)) => {
                Err(Error::Audio(format!("unlock playback failed: {reason}")))
            }
        }
    }
}

/// A trivial silent WAV used to satisfy the gesture requirement
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn silent_clip() -> Result<AudioClip> {
    let wav = samples_to_wav(&[0.0; SILENT_SAMPLES], SILENT_SAMPLE_RATE)?;
    Ok(AudioClip::new("audio/wav", wav))
}
