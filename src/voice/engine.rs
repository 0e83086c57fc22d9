//! Audio playback engine
//!
//! Turns `(text, voice)` into audible output through the fastest strategy the
//! sink allows, with at most one session `playing` at any time.
//!
//! Concurrency model: one cooperative thread. A new session supersedes the
//! active one by signalling its cancel token, then waits for the sink lock,
//! which the superseded session only gives up after stopping output and
//! releasing its transient buffer. Sink events carry a session id and are
//! ignored unless they belong to the session holding the sink.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify, mpsc};

use crate::config::PlaybackConfig;
use crate::flags::SpeakingFlag;
use crate::voice::autoplay::AutoplayGuard;
use crate::voice::decode;
use crate::voice::sink::{
    AudioClip, OutputSink, PlayRejection, SessionId, SinkEvent, SinkEventKind,
};
use crate::voice::strategy::{AttemptContext, Payload, Strategy};
use crate::voice::synthesis::{SynthesisRequest, Synthesizer};
use crate::voice::text::prepare_for_speech;
use crate::{Error, Result};

/// Sessions kept for diagnostics
const HISTORY_LEN: usize = 16;

/// Lifecycle state of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, audio not yet audible
    Pending,
    /// The sink reported output started
    Playing,
    /// Finished naturally or stopped
    Ended,
    /// Failed
    Errored,
    /// Replaced by a newer session
    Superseded,
    /// Blocked by autoplay policy, waiting for a user gesture
    Queued,
}

/// One in-flight or completed speech-output request
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    /// Identity token
    pub id: SessionId,
    /// Text being spoken
    pub text: String,
    /// Voice identifier
    pub voice_id: Option<String>,
    /// Strategy currently or last attempted
    pub strategy: Option<Strategy>,
    /// Bytes received from the synthesis endpoint
    pub bytes_received: usize,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Lifecycle state
    pub state: SessionState,
}

/// Outcome of a `speak` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Session id; `None` when nothing needed to be played
    pub session: Option<SessionId>,
    /// Strategy that produced the output
    pub strategy: Option<Strategy>,
    /// Strategies tried, in order
    pub attempted: Vec<Strategy>,
    /// Faults recovered by falling back, one per failed strategy
    pub recovered: Vec<String>,
    /// Bytes received from the synthesis endpoint
    pub bytes_received: usize,
    /// Terminal state
    pub state: SessionState,
    /// When the session was created
    pub started_at: Option<DateTime<Utc>>,
}

impl PlaybackReport {
    fn skipped() -> Self {
        Self {
            session: None,
            strategy: None,
            attempted: Vec::new(),
            recovered: Vec::new(),
            bytes_received: 0,
            state: SessionState::Ended,
            started_at: None,
        }
    }
}

/// Where a session's audio comes from
enum Source {
    /// One new request to the synthesis endpoint
    Synthesize,
    /// Bytes downloaded by an earlier, blocked session
    Held(AudioClip),
}

/// A session waiting for the autoplay unlock
#[derive(Debug, Clone)]
struct QueuedSession {
    text: String,
    voice_id: Option<String>,
    clip: Option<AudioClip>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Superseded,
    Stopped,
}

/// Per-session cancellation signal
#[derive(Debug, Default)]
struct CancelToken {
    notify: Notify,
    reason: Cell<Option<CancelReason>>,
}

impl CancelToken {
    fn cancel(&self, reason: CancelReason) {
        if self.reason.get().is_none() {
            self.reason.set(Some(reason));
        }
        self.notify.notify_one();
    }

    fn reason(&self) -> Option<CancelReason> {
        self.reason.get()
    }

    async fn cancelled(&self) -> CancelReason {
        loop {
            if let Some(reason) = self.reason.get() {
                return reason;
            }
            self.notify.notified().await;
        }
    }
}

/// How a session run ended, before bookkeeping
enum Outcome {
    Ended(Strategy),
    Cancelled(CancelReason),
    Blocked(Option<AudioClip>),
}

/// Why a strategy attempt did not complete
enum AttemptError {
    /// Recoverable by the next strategy
    Fault(String),
    /// Autoplay policy refused playback
    Blocked,
    /// Ends the session
    Fatal(Error),
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self::Fatal(error)
    }
}

type Attempt = std::result::Result<(), AttemptError>;

/// Typed error for a fault the next strategy recovers from
fn strategy_fault(strategy: Strategy, reason: String) -> Error {
    match strategy {
        Strategy::ChunkedStream => Error::StreamingBufferFault(reason),
        Strategy::DirectBlob | Strategy::DecodeBuffer => Error::Audio(reason),
    }
}

struct SinkSlot {
    sink: Box<dyn OutputSink>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    active: Option<(SessionId, Rc<CancelToken>)>,
    sessions: VecDeque<PlaybackSession>,
    queued: Option<QueuedSession>,
}

impl EngineState {
    fn active_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|(id, _)| *id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut PlaybackSession> {
        self.sessions.iter_mut().rev().find(|s| s.id == id)
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }
}

struct EngineInner {
    synthesizer: Arc<dyn Synthesizer>,
    config: PlaybackConfig,
    sink: Mutex<SinkSlot>,
    state: RefCell<EngineState>,
    speaking: SpeakingFlag,
    guard: AutoplayGuard,
}

impl EngineInner {
    /// Create a session and supersede the active one
    fn register(&self, text: &str, voice_id: Option<&str>) -> (SessionId, Rc<CancelToken>) {
        let mut state = self.state.borrow_mut();
        let id = state.allocate_id();
        let token = Rc::new(CancelToken::default());

        if let Some((previous, previous_token)) = state.active.replace((id, Rc::clone(&token))) {
            tracing::debug!(session = %previous, by = %id, "superseding playback session");
            previous_token.cancel(CancelReason::Superseded);
        }

        state.sessions.push_back(PlaybackSession {
            id,
            text: text.to_string(),
            voice_id: voice_id.map(ToString::to_string),
            strategy: None,
            bytes_received: 0,
            started_at: Utc::now(),
            state: SessionState::Pending,
        });
        while state.sessions.len() > HISTORY_LEN {
            state.sessions.pop_front();
        }

        (id, token)
    }

    fn update(&self, id: SessionId, f: impl FnOnce(&mut PlaybackSession)) {
        if let Some(session) = self.state.borrow_mut().session_mut(id) {
            f(session);
        }
    }

    fn mark_playing(&self, id: SessionId) {
        let mut state = self.state.borrow_mut();
        if state.active_id() != Some(id) {
            tracing::trace!(session = %id, "ignoring start of inactive session");
            return;
        }
        if let Some(session) = state.session_mut(id) {
            session.state = SessionState::Playing;
        }
        drop(state);
        self.speaking.set(true);
        tracing::debug!(session = %id, "playback started");
    }

    /// Record the terminal state and leave the active slot
    fn conclude(&self, id: SessionId, terminal: SessionState) -> Option<PlaybackSession> {
        self.speaking.set(false);
        let mut state = self.state.borrow_mut();
        if state.active_id() == Some(id) {
            state.active = None;
        }
        let session = state.session_mut(id)?;
        session.state = terminal;
        Some(session.clone())
    }
}

/// Owns the output sink and speaks replies
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Rc<EngineInner>,
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("config", &self.inner.config)
            .field("speaking", &self.inner.speaking.get())
            .field("blocked", &self.inner.guard.is_blocked())
            .finish_non_exhaustive()
    }
}

impl PlaybackEngine {
    /// Create an engine that exclusively owns `sink`
    pub fn new(
        mut sink: impl OutputSink + 'static,
        synthesizer: Arc<dyn Synthesizer>,
        config: PlaybackConfig,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        sink.attach(events_tx);

        tracing::debug!(
            enabled = config.enabled,
            short_text_chars = config.short_text_chars,
            "playback engine initialized"
        );

        Self {
            inner: Rc::new(EngineInner {
                synthesizer,
                config,
                sink: Mutex::new(SinkSlot {
                    sink: Box::new(sink),
                    events,
                }),
                state: RefCell::new(EngineState::default()),
                speaking: SpeakingFlag::default(),
                guard: AutoplayGuard::new(),
            }),
        }
    }

    /// Speak `text`, resolving when output ends, is stopped, or is superseded
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` or `SynthesisUnavailable` from the endpoint,
    /// `PlaybackBlocked` when autoplay policy refused output (the session is
    /// queued for [`Self::unlock_with_gesture`]), or an audio error when no
    /// strategy could play the audio
    pub async fn speak(&self, text: &str, voice_id: Option<&str>) -> Result<PlaybackReport> {
        let text = prepare_for_speech(text);
        self.run(text, voice_id.map(ToString::to_string), Source::Synthesize)
            .await
    }

    /// Halt output; the active session ends as `Ended`. Discards any queued session.
    ///
    /// Safe in every state; a no-op when nothing is active.
    pub async fn stop(&self) {
        if !self.request_stop() {
            return;
        }

        // The session gives the sink up only after its cleanup ran
        let mut slot = self.inner.sink.lock().await;
        slot.sink.stop();
    }

    /// Signal the active session to stop without waiting for its cleanup
    ///
    /// For callers that are themselves driving the `speak` future; the
    /// future resolves with an `Ended` report once cleanup is done.
    /// Returns whether a session was active.
    pub fn request_stop(&self) -> bool {
        let active = {
            let mut state = self.inner.state.borrow_mut();
            state.queued = None;
            state.active.take()
        };

        let Some((id, token)) = active else {
            tracing::trace!("stop requested with nothing playing");
            return false;
        };

        tracing::debug!(session = %id, "stopping playback");
        token.cancel(CancelReason::Stopped);
        true
    }

    /// True exactly while a session is `playing`
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner.speaking.get()
    }

    /// Shared speaking flag for synchronous reads elsewhere
    #[must_use]
    pub fn speaking_flag(&self) -> SpeakingFlag {
        self.inner.speaking.clone()
    }

    /// Autoplay-policy guard for this engine's sink
    #[must_use]
    pub fn autoplay(&self) -> &AutoplayGuard {
        &self.inner.guard
    }

    /// Whether a blocked session is waiting for a gesture
    #[must_use]
    pub fn has_queued(&self) -> bool {
        self.inner.state.borrow().queued.is_some()
    }

    /// Whether audio output is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Recent sessions, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<PlaybackSession> {
        self.inner.state.borrow().sessions.iter().cloned().collect()
    }

    /// Handle a user gesture: unlock autoplay if blocked, then resume the queued session
    ///
    /// # Errors
    ///
    /// Returns `PlaybackBlocked` if the unlock was refused again, or any
    /// error of the resumed session
    pub async fn unlock_with_gesture(&self) -> Result<Option<PlaybackReport>> {
        if self.inner.guard.is_blocked() {
            let id = self.inner.state.borrow_mut().allocate_id();
            let mut slot = self.inner.sink.lock().await;
            self.inner.guard.unlock(slot.sink.as_mut(), id).await?;
        }
        self.resume_queued().await
    }

    /// Play the queued session, reusing its downloaded bytes when still held
    ///
    /// # Errors
    ///
    /// Returns `PlaybackBlocked` while the guard is still blocked, or any
    /// error of the resumed session
    pub async fn resume_queued(&self) -> Result<Option<PlaybackReport>> {
        if self.inner.guard.is_blocked() {
            return Err(Error::PlaybackBlocked);
        }

        let Some(queued) = self.inner.state.borrow_mut().queued.take() else {
            return Ok(None);
        };

        let source = match queued.clip {
            Some(clip) if !clip.bytes.is_empty() => {
                tracing::debug!(bytes = clip.bytes.len(), "resuming queued session from held audio");
                Source::Held(clip)
            }
            _ => {
                tracing::debug!("resuming queued session, audio no longer held");
                Source::Synthesize
            }
        };

        self.run(queued.text, queued.voice_id, source).await.map(Some)
    }

    async fn run(
        &self,
        text: String,
        voice_id: Option<String>,
        source: Source,
    ) -> Result<PlaybackReport> {
        let inner = &*self.inner;
        if text.is_empty() || !inner.config.enabled {
            tracing::debug!(enabled = inner.config.enabled, "nothing to speak");
            return Ok(PlaybackReport::skipped());
        }

        let (id, token) = inner.register(&text, voice_id.as_deref());
        let slot = inner.sink.lock().await;

        let mut run = SessionRun::new(inner, slot, id);
        let outcome = if let Some(reason) = token.reason() {
            tracing::debug!(session = %id, ?reason, "cancelled before reaching the sink");
            Ok(Outcome::Cancelled(reason))
        } else {
            tokio::select! {
                biased;
                reason = token.cancelled() => Ok(Outcome::Cancelled(reason)),
                result = run.execute(&text, voice_id.as_deref(), source) => result,
            }
        };

        run.release();
        let attempted = std::mem::take(&mut run.attempted);
        let recovered = std::mem::take(&mut run.recovered);
        drop(run);

        let (terminal, result) = match outcome {
            Ok(Outcome::Ended(strategy)) => {
                tracing::debug!(session = %id, %strategy, "playback ended");
                (SessionState::Ended, Ok(()))
            }
            Ok(Outcome::Cancelled(CancelReason::Superseded)) => (SessionState::Superseded, Ok(())),
            Ok(Outcome::Cancelled(CancelReason::Stopped)) => (SessionState::Ended, Ok(())),
            Ok(Outcome::Blocked(held)) => {
                inner.guard.mark_blocked();
                inner.state.borrow_mut().queued = Some(QueuedSession {
                    text,
                    voice_id,
                    clip: held,
                });
                (SessionState::Queued, Err(Error::PlaybackBlocked))
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "playback failed");
                (SessionState::Errored, Err(e))
            }
        };

        let session = inner.conclude(id, terminal);
        result?;

        Ok(PlaybackReport {
            session: Some(id),
            strategy: session.as_ref().and_then(|s| {
                (s.state == SessionState::Ended).then_some(s.strategy).flatten()
            }),
            attempted,
            recovered,
            bytes_received: session.as_ref().map_or(0, |s| s.bytes_received),
            state: terminal,
            started_at: session.map(|s| s.started_at),
        })
    }
}

/// A session holding the sink
struct SessionRun<'a> {
    inner: &'a EngineInner,
    slot: MutexGuard<'a, SinkSlot>,
    id: SessionId,
    attempted: Vec<Strategy>,
    recovered: Vec<String>,
    ended: bool,
    released: bool,
}

impl<'a> SessionRun<'a> {
    fn new(inner: &'a EngineInner, slot: MutexGuard<'a, SinkSlot>, id: SessionId) -> Self {
        let mut run = Self {
            inner,
            slot,
            id,
            attempted: Vec::new(),
            recovered: Vec::new(),
            ended: false,
            released: false,
        };
        run.discard_pending_events();
        run
    }

    /// Drop events raised before the current attempt
    fn discard_pending_events(&mut self) {
        while let Ok(stale) = self.slot.events.try_recv() {
            tracing::trace!(session = %stale.session, kind = ?stale.kind, "dropping stale sink event");
        }
    }

    async fn execute(
        &mut self,
        text: &str,
        voice_id: Option<&str>,
        source: Source,
    ) -> Result<Outcome> {
        let mut payload = match source {
            Source::Synthesize => {
                let request = SynthesisRequest {
                    text: text.to_string(),
                    voice_id: voice_id.map(ToString::to_string),
                };
                Payload::from_response(self.inner.synthesizer.synthesize(&request).await?)
            }
            Source::Held(clip) => Payload::from_clip(clip),
        };

        let mut ctx = AttemptContext {
            text_chars: text.chars().count(),
            short_text_chars: self.inner.config.short_text_chars,
            streaming_supported: self.slot.sink.supports_streaming(payload.mime()),
            decodable: false,
        };
        let mut last_fault = None;

        for strategy in Strategy::ORDER {
            ctx.decodable = payload.decodable();
            if !strategy.can_attempt(&ctx, &payload) {
                tracing::trace!(session = %self.id, %strategy, "strategy not applicable");
                continue;
            }

            self.attempted.push(strategy);
            self.inner.update(self.id, |s| s.strategy = Some(strategy));
            tracing::debug!(session = %self.id, %strategy, "attempting playback strategy");

            let attempt = match strategy {
                Strategy::ChunkedStream => self.play_stream(&mut payload).await,
                Strategy::DirectBlob => self.play_blob(&mut payload).await,
                Strategy::DecodeBuffer => self.play_decoded(&mut payload).await,
            };

            let received = payload.bytes_received();
            self.inner.update(self.id, |s| s.bytes_received = received);

            match attempt {
                Ok(()) => return Ok(Outcome::Ended(strategy)),
                Err(AttemptError::Fault(reason)) => {
                    let fault = strategy_fault(strategy, reason);
                    tracing::warn!(
                        session = %self.id,
                        %strategy,
                        error = %fault,
                        "playback strategy failed, falling back"
                    );
                    self.slot.sink.stop();
                    self.discard_pending_events();
                    self.ended = false;
                    self.recovered.push(fault.to_string());
                    last_fault = Some(fault);
                }
                Err(AttemptError::Blocked) => {
                    let held = match payload.collect().await {
                        Ok(clip) => Some(clip),
                        Err(e) => {
                            tracing::warn!(session = %self.id, error = %e, "could not hold audio for retry");
                            None
                        }
                    };
                    return Ok(Outcome::Blocked(held));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }

        Err(Error::Audio(last_fault.map_or_else(
            || "no playback strategy applicable".to_string(),
            |fault| format!("no playback strategy could play the audio: {fault}"),
        )))
    }

    /// Chunked-stream: append each chunk as it arrives, play after the first
    async fn play_stream(&mut self, payload: &mut Payload) -> Attempt {
        let mime = payload.mime().to_string();
        let timeout = self.inner.config.stream_open_timeout;

        match tokio::time::timeout(timeout, self.slot.sink.open_stream(self.id, &mime)).await {
            Err(_) => {
                return Err(AttemptError::Fault(format!(
                    "streaming buffer did not open within {}ms",
                    timeout.as_millis()
                )));
            }
            Ok(Err(fault)) => return Err(AttemptError::Fault(fault.0)),
            Ok(Ok(())) => {}
        }

        let mut started = false;
        while let Some(chunk) = payload.next_chunk().await? {
            self.slot
                .sink
                .append(&chunk)
                .await
                .map_err(|fault| AttemptError::Fault(fault.0))?;

            if !started {
                self.start_output().await?;
                started = true;
            }
            self.pump_events()?;
        }

        if !started {
            return Err(AttemptError::Fatal(Error::SynthesisUnavailable(
                "endpoint returned no audio".to_string(),
            )));
        }

        self.slot.sink.end_stream();
        self.wait_for_end().await
    }

    /// Direct-blob: whole body, one clip
    async fn play_blob(&mut self, payload: &mut Payload) -> Attempt {
        let clip = payload.collect().await?;
        if clip.bytes.is_empty() {
            return Err(AttemptError::Fatal(Error::SynthesisUnavailable(
                "endpoint returned no audio".to_string(),
            )));
        }

        self.slot
            .sink
            .load_clip(self.id, &clip)
            .await
            .map_err(|fault| AttemptError::Fault(fault.0))?;
        self.start_output().await?;
        self.wait_for_end().await
    }

    /// Decode-buffer: decode off the event loop, play raw samples
    async fn play_decoded(&mut self, payload: &mut Payload) -> Attempt {
        let clip = payload.collect().await?;
        let audio = tokio::task::spawn_blocking(move || decode::decode_clip(&clip))
            .await
            .map_err(|e| AttemptError::Fatal(Error::Audio(e.to_string())))?
            .map_err(|e| AttemptError::Fault(e.to_string()))?;

        tracing::debug!(
            session = %self.id,
            sample_rate = audio.sample_rate,
            duration_ms = audio.duration_ms(),
            "decoded audio"
        );

        self.slot
            .sink
            .load_decoded(self.id, audio)
            .await
            .map_err(|fault| AttemptError::Fault(fault.0))?;
        self.start_output().await?;
        self.wait_for_end().await
    }

    async fn start_output(&mut self) -> Attempt {
        match self.slot.sink.play().await {
            Ok(()) => Ok(()),
            Err(PlayRejection::NotAllowed) => Err(AttemptError::Blocked),
            Err(PlayRejection::Failed(reason)) => Err(AttemptError::Fault(reason)),
        }
    }

    /// Handle whatever events are already queued, without waiting
    fn pump_events(&mut self) -> Attempt {
        while let Ok(event) = self.slot.events.try_recv() {
            if let Some(result) = self.on_event(event) {
                return result;
            }
        }
        Ok(())
    }

    async fn wait_for_end(&mut self) -> Attempt {
        if self.ended {
            return Ok(());
        }
        loop {
            let Some(event) = self.slot.events.recv().await else {
                return Err(AttemptError::Fatal(Error::Audio(
                    "output sink closed its event channel".to_string(),
                )));
            };
            if let Some(result) = self.on_event(event) {
                return result;
            }
        }
    }

    /// React to one sink event; `Some` ends the wait
    fn on_event(&mut self, event: SinkEvent) -> Option<Attempt> {
        if event.session != self.id {
            tracing::trace!(
                session = %event.session,
                active = %self.id,
                kind = ?event.kind,
                "ignoring event from another session"
            );
            return None;
        }

        match event.kind {
            SinkEventKind::Started => {
                self.inner.mark_playing(self.id);
                None
            }
            SinkEventKind::Ended => {
                self.ended = true;
                Some(Ok(()))
            }
            SinkEventKind::Failed(reason) => Some(Err(AttemptError::Fault(reason))),
        }
    }

    /// Stop output and free the session's transient buffer, exactly once
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.slot.sink.stop();
        self.slot.sink.release(self.id);
        tracing::trace!(session = %self.id, "released session buffer");
    }
}

impl Drop for SessionRun<'_> {
    fn drop(&mut self) {
        if !self.released {
            // The speak future was dropped mid-session
            self.release();
            self.inner.conclude(self.id, SessionState::Superseded);
        }
    }
}
