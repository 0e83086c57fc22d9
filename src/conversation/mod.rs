//! Conversation-mode coordinator
//!
//! The state machine that glues capture and playback into a hands-free loop:
//!
//! ```text
//!   idle ──mode on / mic──▶ listening ──final transcript──▶ submitting
//!    ▲                          ▲                               │
//!    │                          └──── ended (mode on) ──┐       │ reply
//!    └────────────── ended (mode off) ──────────────── speaking ◀┘
//! ```
//!
//! Recognition is stopped before `speak` is invoked and is only re-armed
//! after the `speak` future has resolved, so capture and playback never
//! overlap.

mod relay;
mod store;

pub use relay::{CompletionRelay, HttpCompletionRelay};
pub use store::{InMemoryMessageStore, MessageStore, Role, StoredMessage};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use crate::flags::{ListeningFlag, ModeFlag, SpeakingFlag};
use crate::recognition::{CapturePrimitive, RecognitionController, RecognitionUpdate};
use crate::voice::{PlaybackEngine, PlaybackReport};
use crate::{Error, Result};

/// Channel capacity for conversation events
const EVENT_CAPACITY: usize = 64;

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Nothing in progress
    Idle,
    /// Capture is armed and waiting for an utterance
    Listening,
    /// Waiting for the completion relay
    Submitting,
    /// The reply is being spoken
    Speaking,
}

impl ConversationState {
    /// Stable name for logs and UI
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Submitting => "submitting",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User action sent to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enable or disable hands-free conversation mode
    SetConversationMode(bool),
    /// Manual microphone toggle
    ToggleMic,
    /// Typed user input
    Submit(String),
    /// A user gesture (click, key press); unlocks blocked playback
    UserGesture,
    /// Cut off the assistant
    StopSpeaking,
    /// End the run loop
    Shutdown,
}

/// Notification for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// Coordinator state changed
    StateChanged(ConversationState),
    /// A user utterance was recognized
    Transcript(String),
    /// The assistant replied
    Reply(String),
    /// A reply finished playing (or was cut off)
    Playback(PlaybackReport),
    /// Playback needs a user gesture before it can continue
    Blocked,
    /// Voice output turned off for the rest of the run
    VoiceDisabled(String),
    /// A surfaced failure, human readable
    Error(String),
}

/// Cloneable handle for driving and observing a running coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConversationEvent>,
    state: watch::Receiver<ConversationState>,
    mode: ModeFlag,
    speaking: SpeakingFlag,
    listening: ListeningFlag,
}

impl CoordinatorHandle {
    /// Send a command; ignored once the coordinator has shut down
    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("coordinator gone, command dropped");
        }
    }

    /// Turn hands-free mode on or off
    pub fn set_conversation_mode(&self, enabled: bool) {
        self.send(Command::SetConversationMode(enabled));
    }

    /// Start listening, or stop if already listening
    pub fn toggle_mic(&self) {
        self.send(Command::ToggleMic);
    }

    /// Submit typed input as a user turn
    pub fn submit(&self, text: impl Into<String>) {
        self.send(Command::Submit(text.into()));
    }

    /// Report a user gesture; plays a reply held by the autoplay guard
    pub fn user_gesture(&self) {
        self.send(Command::UserGesture);
    }

    /// Cut off the current reply
    pub fn stop_speaking(&self) {
        self.send(Command::StopSpeaking);
    }

    /// Stop the coordinator loop
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Subscribe to conversation events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Current coordinator state
    #[must_use]
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Watch coordinator state
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// Whether hands-free mode is on
    #[must_use]
    pub fn is_conversation_mode(&self) -> bool {
        self.mode.get()
    }

    /// Whether a reply is audible right now
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.get()
    }

    /// Whether capture is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }
}

/// Runs the hands-free loop
pub struct Coordinator {
    engine: PlaybackEngine,
    recognition: RecognitionController,
    relay: Arc<dyn CompletionRelay>,
    store: Arc<dyn MessageStore>,
    voice_id: Option<String>,
    mode: ModeFlag,
    voice_enabled: bool,
    listen_after_reply: bool,
    holding_input: bool,
    held_input: VecDeque<String>,
    shutting_down: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConversationState>,
    events: broadcast::Sender<ConversationEvent>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &*self.state.borrow())
            .field("mode", &self.mode.get())
            .field("voice_enabled", &self.voice_enabled)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Wire a coordinator around `engine` and `capture`
    ///
    /// The recognition controller is built here so that it reads the same
    /// mode flag and the engine's speaking flag.
    pub fn new(
        engine: PlaybackEngine,
        capture: impl CapturePrimitive + 'static,
        relay: Arc<dyn CompletionRelay>,
        store: Arc<dyn MessageStore>,
        voice_id: Option<String>,
        conversation_mode: bool,
    ) -> (Self, CoordinatorHandle) {
        let mode = ModeFlag::new(conversation_mode);
        let recognition = RecognitionController::new(capture, mode.clone(), engine.speaking_flag());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConversationState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = CoordinatorHandle {
            commands: commands_tx,
            events: events.clone(),
            state: state_rx,
            mode: mode.clone(),
            speaking: engine.speaking_flag(),
            listening: recognition.listening_flag(),
        };

        let voice_enabled = engine.is_enabled();
        let coordinator = Self {
            engine,
            recognition,
            relay,
            store,
            voice_id,
            mode,
            voice_enabled,
            listen_after_reply: false,
            holding_input: false,
            held_input: VecDeque::new(),
            shutting_down: false,
            commands,
            state,
            events,
        };

        (coordinator, handle)
    }

    /// Run until shutdown
    ///
    /// # Errors
    ///
    /// Returns error only if the loop cannot continue; turn failures are
    /// reported as [`ConversationEvent::Error`]
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(mode = self.mode.get(), voice = self.voice_enabled, "conversation loop started");

        if self.mode.get() {
            self.begin_listening();
        }

        while !self.shutting_down {
            tokio::select! {
                command = self.commands.recv() => {
                    self.on_command(command.unwrap_or(Command::Shutdown)).await?;
                }
                update = self.recognition.next_update() => {
                    self.on_recognition(update).await?;
                }
            }
        }

        self.recognition.stop();
        self.engine.stop().await;
        self.set_state(ConversationState::Idle);
        tracing::info!("conversation loop stopped");
        Ok(())
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        tracing::debug!(?command, state = %self.current_state(), "command");

        match command {
            Command::SetConversationMode(true) => {
                self.mode.set(true);
                if self.current_state() == ConversationState::Idle {
                    self.begin_listening();
                }
            }
            Command::SetConversationMode(false) => {
                self.mode.set(false);
                self.recognition.stop();
                self.set_state(ConversationState::Idle);
            }
            Command::ToggleMic => {
                if self.recognition.is_listening() {
                    self.recognition.stop();
                    self.set_state(ConversationState::Idle);
                } else {
                    self.begin_listening();
                }
            }
            Command::Submit(text) => self.take_turn(text).await?,
            Command::UserGesture => self.on_gesture().await?,
            Command::StopSpeaking => self.engine.stop().await,
            Command::Shutdown => self.shutting_down = true,
        }
        Ok(())
    }

    async fn on_recognition(&mut self, update: RecognitionUpdate) -> Result<()> {
        match update {
            // Single-shot or not, capture stops for the turn
            RecognitionUpdate::Final(text) => self.take_turn(text).await?,
            RecognitionUpdate::Error(e) => {
                self.report_error(&e);
                self.set_state(ConversationState::Idle);
            }
            RecognitionUpdate::Ended => self.set_state(ConversationState::Idle),
        }
        Ok(())
    }

    /// One full turn: submit, fetch the reply, speak it
    async fn take_turn(&mut self, text: String) -> Result<()> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }
        self.recognition.stop();
        self.set_state(ConversationState::Submitting);
        self.emit(ConversationEvent::Transcript(text.clone()));

        self.store.append(Role::User, &text)?;
        let history = self.store.list()?;

        let Some(reply) = self.fetch_reply(&history).await else {
            return Ok(());
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.report_error(&e);
                self.finish_turn();
                return Ok(());
            }
        };

        self.store.append(Role::Assistant, &reply)?;
        self.emit(ConversationEvent::Reply(reply.clone()));

        if !self.voice_enabled {
            self.finish_turn();
            return Ok(());
        }

        self.set_state(ConversationState::Speaking);
        let engine = self.engine.clone();
        let voice_id = self.voice_id.clone();
        let speak = async {
            engine
                .speak(&reply, voice_id.as_deref())
                .await
                .map(Some)
        };
        let result = self.drive_playback(speak).await;
        self.after_playback(result);
        Ok(())
    }

    /// Wait for the relay; `None` when the turn was cancelled
    async fn fetch_reply(&mut self, history: &[StoredMessage]) -> Option<Result<String>> {
        let relay = Arc::clone(&self.relay);
        let request = relay.reply(history);
        tokio::pin!(request);

        loop {
            tokio::select! {
                reply = &mut request => return Some(reply),
                command = self.commands.recv() => {
                    match command.unwrap_or(Command::Shutdown) {
                        Command::SetConversationMode(false) => {
                            self.mode.set(false);
                            tracing::debug!("conversation mode off, reply request cancelled");
                            self.set_state(ConversationState::Idle);
                            return None;
                        }
                        Command::StopSpeaking => {
                            tracing::debug!("reply request cancelled");
                            self.finish_turn();
                            return None;
                        }
                        Command::Shutdown => {
                            self.shutting_down = true;
                            return None;
                        }
                        other => self.defer_command(other),
                    }
                }
            }
        }
    }

    /// Poll a playback future while still handling commands
    ///
    /// Mode off lets the reply finish; stop cuts it off.
    async fn drive_playback<F>(&mut self, playback: F) -> Result<Option<PlaybackReport>>
    where
        F: Future<Output = Result<Option<PlaybackReport>>>,
    {
        tokio::pin!(playback);

        loop {
            tokio::select! {
                biased;
                result = &mut playback => return result,
                command = self.commands.recv() => {
                    match command.unwrap_or(Command::Shutdown) {
                        Command::SetConversationMode(false) => {
                            self.mode.set(false);
                            self.listen_after_reply = false;
                            self.recognition.stop();
                            self.set_state(ConversationState::Idle);
                            tracing::debug!("conversation mode off, letting the reply finish");
                        }
                        Command::StopSpeaking => {
                            self.engine.request_stop();
                        }
                        Command::Shutdown => {
                            self.shutting_down = true;
                            self.engine.request_stop();
                        }
                        other => self.defer_command(other),
                    }
                }
            }
        }
    }

    /// Commands that arrive mid-turn and only affect what happens after it
    fn defer_command(&mut self, command: Command) {
        match command {
            Command::SetConversationMode(true) => {
                self.mode.set(true);
            }
            Command::ToggleMic => {
                self.listen_after_reply = !self.listen_after_reply;
            }
            Command::Submit(text) if self.holding_input => {
                tracing::debug!("input held until the queued reply finishes");
                self.held_input.push_back(text);
            }
            Command::Submit(_) => {
                tracing::debug!("turn in progress, input dropped");
            }
            Command::UserGesture => {
                tracing::trace!("gesture while busy ignored");
            }
            Command::SetConversationMode(false) | Command::StopSpeaking | Command::Shutdown => {}
        }
    }

    async fn on_gesture(&mut self) -> Result<()> {
        if !self.engine.autoplay().is_blocked() && !self.engine.has_queued() {
            tracing::trace!("gesture with nothing to unlock");
            return Ok(());
        }

        self.recognition.stop();
        self.set_state(ConversationState::Speaking);
        let engine = self.engine.clone();

        // The gesture that unlocks playback often arrives with typed input
        self.holding_input = true;
        let result = self.drive_playback(engine.unlock_with_gesture()).await;
        self.holding_input = false;
        self.after_playback(result);

        while let Some(text) = self.held_input.pop_front() {
            if self.shutting_down {
                self.held_input.clear();
                break;
            }
            self.take_turn(text).await?;
        }
        Ok(())
    }

    fn after_playback(&mut self, result: Result<Option<PlaybackReport>>) {
        match result {
            Ok(Some(report)) => {
                tracing::debug!(state = ?report.state, strategy = ?report.strategy, "reply played");
                self.emit(ConversationEvent::Playback(report));
            }
            Ok(None) => {}
            Err(Error::PlaybackBlocked) => {
                tracing::info!("reply queued until the next user gesture");
                self.emit(ConversationEvent::Blocked);
                self.set_state(ConversationState::Idle);
                return;
            }
            Err(Error::QuotaExceeded(reason)) => {
                tracing::warn!(reason = %reason, "voice budget exhausted, voice output disabled");
                self.voice_enabled = false;
                self.emit(ConversationEvent::VoiceDisabled(reason.clone()));
                self.report_error(&Error::QuotaExceeded(reason));
            }
            Err(e) => self.report_error(&e),
        }
        self.finish_turn();
    }

    /// Re-arm capture if the loop continues, otherwise go idle
    fn finish_turn(&mut self) {
        let listen = std::mem::take(&mut self.listen_after_reply);
        if self.shutting_down {
            return;
        }
        if self.mode.get() || listen {
            self.begin_listening();
        } else {
            self.set_state(ConversationState::Idle);
        }
    }

    fn begin_listening(&mut self) {
        match self.recognition.start() {
            Ok(()) => self.set_state(ConversationState::Listening),
            Err(e) => {
                self.report_error(&e);
                self.set_state(ConversationState::Idle);
            }
        }
    }

    fn current_state(&self) -> ConversationState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConversationState) {
        let changed = self.state.send_if_modified(|state| {
            let was = *state;
            *state = next;
            was != next
        });
        if changed {
            tracing::debug!(state = %next, "conversation state");
            self.emit(ConversationEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report_error(&self, error: &Error) {
        tracing::error!(error = %error, "conversation turn failed");
        self.emit(ConversationEvent::Error(error.to_string()));
    }
}
