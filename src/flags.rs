//! Cross-component boolean flags
//!
//! The UI layer reads these synchronously at any time; components that own
//! the underlying state are the only writers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cheaply cloneable shared boolean
#[derive(Debug, Clone, Default)]
pub struct SharedFlag(Arc<AtomicBool>);

impl SharedFlag {
    /// Create a flag with an initial value
    #[must_use]
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the value, returning the previous one
    pub fn set(&self, value: bool) -> bool {
        self.0.swap(value, Ordering::SeqCst)
    }
}

/// Hands-free conversation mode, toggled by the user
pub type ModeFlag = SharedFlag;

/// True exactly while a playback session is `playing`
pub type SpeakingFlag = SharedFlag;

/// True while the recognition controller is capturing
pub type ListeningFlag = SharedFlag;
