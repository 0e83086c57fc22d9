//! Shared test utilities
//!
//! Scripted doubles for the output sink, the synthesis endpoint, the capture
//! primitive, and the completion relay. Everything runs on the test's
//! single-threaded runtime.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use voxloop::conversation::{CompletionRelay, StoredMessage};
use voxloop::recognition::{CaptureEvent, CaptureFault, CapturePrimitive};
use voxloop::voice::synthesis::classify_failure;
use voxloop::voice::{
    AudioClip, DecodedAudio, OutputSink, PlayRejection, SessionId, SinkEvent, SinkEventKind,
    SinkEvents, SinkFault, SynthesisRequest, SynthesisResponse, Synthesizer,
};
use voxloop::Error;

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// One recorded sink call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    LoadClip(SessionId),
    LoadDecoded(SessionId),
    OpenStream(SessionId),
    Append(usize),
    EndStream,
    Play,
    Stop,
    Release(SessionId),
}

/// Knobs for the scripted sink
#[derive(Debug, Clone)]
pub struct SinkBehavior {
    /// Chunked append facility present
    pub streaming: bool,
    /// `open_stream` never signals open
    pub open_hangs: bool,
    /// The nth append (0-based) fails
    pub fail_append_at: Option<usize>,
    /// `load_clip` fails
    pub reject_clip: bool,
    /// `play` is refused by autoplay policy
    pub autoplay_blocked: bool,
    /// Raise `Ended` as soon as the loaded audio is complete
    pub auto_end: bool,
}

impl Default for SinkBehavior {
    fn default() -> Self {
        Self {
            streaming: true,
            open_hangs: false,
            fail_append_at: None,
            reject_clip: false,
            autoplay_blocked: false,
            auto_end: true,
        }
    }
}

#[derive(Default)]
struct SinkState {
    behavior: SinkBehavior,
    events: Option<SinkEvents>,
    session: Option<SessionId>,
    streaming: bool,
    complete: bool,
    playing: bool,
    appends: usize,
    held: Vec<u8>,
    calls: Vec<SinkCall>,
    played: Vec<(SessionId, Vec<u8>)>,
    probe: Option<Box<dyn Fn() -> bool>>,
    probed: Vec<bool>,
}

impl SinkState {
    fn emit(&self, kind: SinkEventKind) {
        if let (Some(events), Some(session)) = (&self.events, self.session) {
            let _ = events.send(SinkEvent::new(session, kind));
        }
    }

    fn maybe_end(&mut self) {
        if self.behavior.auto_end && self.playing && self.complete {
            self.playing = false;
            let bytes = self.held.clone();
            if let Some(session) = self.session {
                self.played.push((session, bytes));
            }
            self.emit(SinkEventKind::Ended);
        }
    }
}

/// Scripted output sink; clones share state so the test keeps a handle
#[derive(Clone, Default)]
pub struct MockSink {
    state: Rc<RefCell<SinkState>>,
}

impl MockSink {
    pub fn new(behavior: SinkBehavior) -> Self {
        let sink = Self::default();
        sink.state.borrow_mut().behavior = behavior;
        sink
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.borrow().calls.clone()
    }

    /// Number of calls matching `pred`
    pub fn count(&self, pred: impl Fn(&SinkCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    /// Sessions whose buffer was released, in order
    pub fn released(&self) -> Vec<SessionId> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Release(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Audio that played to the end, per session
    pub fn played(&self) -> Vec<(SessionId, Vec<u8>)> {
        self.state.borrow().played.clone()
    }

    /// Let `play` succeed from now on
    pub fn allow_autoplay(&self) {
        self.state.borrow_mut().behavior.autoplay_blocked = false;
    }

    /// Evaluate `probe` on every `play` call
    pub fn set_probe(&self, probe: impl Fn() -> bool + 'static) {
        self.state.borrow_mut().probe = Some(Box::new(probe));
    }

    /// Probe results, one per `play`
    pub fn probed(&self) -> Vec<bool> {
        self.state.borrow().probed.clone()
    }

    /// Raise `Ended` for the loaded session
    pub fn finish(&self) {
        let mut state = self.state.borrow_mut();
        state.playing = false;
        let bytes = state.held.clone();
        if let Some(session) = state.session {
            state.played.push((session, bytes));
        }
        state.emit(SinkEventKind::Ended);
    }

    /// Raise an event for an arbitrary session
    pub fn raise(&self, session: SessionId, kind: SinkEventKind) {
        if let Some(events) = &self.state.borrow().events {
            let _ = events.send(SinkEvent::new(session, kind));
        }
    }
}

#[async_trait(?Send)]
impl OutputSink for MockSink {
    fn attach(&mut self, events: SinkEvents) {
        self.state.borrow_mut().events = Some(events);
    }

    fn supports_streaming(&self, _mime: &str) -> bool {
        self.state.borrow().behavior.streaming
    }

    async fn load_clip(&mut self, session: SessionId, clip: &AudioClip) -> Result<(), SinkFault> {
        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::LoadClip(session));
        if state.behavior.reject_clip {
            return Err(SinkFault::new("clip format not supported"));
        }
        state.session = Some(session);
        state.held = clip.bytes.clone();
        state.streaming = false;
        state.complete = true;
        Ok(())
    }

    async fn load_decoded(
        &mut self,
        session: SessionId,
        audio: DecodedAudio,
    ) -> Result<(), SinkFault> {
        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::LoadDecoded(session));
        state.session = Some(session);
        state.held = vec![0; audio.samples.len()];
        state.streaming = false;
        state.complete = true;
        Ok(())
    }

    async fn open_stream(&mut self, session: SessionId, _mime: &str) -> Result<(), SinkFault> {
        let hangs = {
            let mut state = self.state.borrow_mut();
            state.calls.push(SinkCall::OpenStream(session));
            state.session = Some(session);
            state.held.clear();
            state.streaming = true;
            state.complete = false;
            state.appends = 0;
            state.behavior.open_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn append(&mut self, chunk: &[u8]) -> Result<(), SinkFault> {
        // One pending append at a time: the "update finished" signal
        tokio::task::yield_now().await;

        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::Append(chunk.len()));
        let index = state.appends;
        state.appends += 1;
        if state.behavior.fail_append_at == Some(index) {
            return Err(SinkFault::new("append failed: buffer in invalid state"));
        }
        state.held.extend_from_slice(chunk);
        Ok(())
    }

    fn end_stream(&mut self) {
        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::EndStream);
        state.complete = true;
        state.maybe_end();
    }

    async fn play(&mut self) -> Result<(), PlayRejection> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.calls.push(SinkCall::Play);
        if let Some(probe) = &state.probe {
            let value = probe();
            state.probed.push(value);
        }
        if state.behavior.autoplay_blocked {
            return Err(PlayRejection::NotAllowed);
        }
        state.playing = true;
        state.emit(SinkEventKind::Started);
        state.maybe_end();
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::Stop);
        state.playing = false;
    }

    fn release(&mut self, session: SessionId) {
        let mut state = self.state.borrow_mut();
        state.calls.push(SinkCall::Release(session));
        if state.session == Some(session) {
            state.session = None;
            state.held.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis endpoint
// ---------------------------------------------------------------------------

/// One scripted synthesis response
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Audio body delivered in these chunks
    Audio(Vec<Vec<u8>>),
    /// Audio body that fails after these chunks
    Truncated(Vec<Vec<u8>>),
    /// Error response with this status and JSON body
    Failure(u16, String),
}

/// Scripted synthesis endpoint that counts requests
#[derive(Debug)]
pub struct MockSynthesizer {
    mime: String,
    replies: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    requests: AtomicUsize,
    texts: Mutex<Vec<String>>,
}

impl MockSynthesizer {
    /// Always answer with `chunks` of MP3-typed audio
    pub fn audio(chunks: Vec<Vec<u8>>) -> Self {
        Self::with_fallback(MockReply::Audio(chunks))
    }

    pub fn with_fallback(fallback: MockReply) -> Self {
        Self {
            mime: "audio/mpeg".to_string(),
            replies: Mutex::new(VecDeque::new()),
            fallback,
            requests: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
        }
    }

    /// Override the response MIME type
    #[must_use]
    pub fn with_mime(mut self, mime: &str) -> Self {
        self.mime = mime.to_string();
        self
    }

    /// Queue a one-off reply ahead of the fallback
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Requests received
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Texts requested, in order
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> voxloop::Result<SynthesisResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(request.text.clone());

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let body: Vec<voxloop::Result<Vec<u8>>> = match reply {
            MockReply::Audio(chunks) => chunks.into_iter().map(Ok).collect(),
            MockReply::Truncated(chunks) => chunks
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(Error::SynthesisUnavailable(
                    "connection reset".to_string(),
                ))))
                .collect(),
            MockReply::Failure(status, body) => return Err(classify_failure(status, &body)),
        };

        Ok(SynthesisResponse {
            mime: self.mime.clone(),
            body: futures::stream::iter(body).boxed(),
        })
    }
}

/// A payload split into `n` chunks of `size` bytes with distinct contents
pub fn chunks(n: u8, size: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| vec![i + 1; size]).collect()
}

/// Concatenate chunks
pub fn joined(chunks: &[Vec<u8>]) -> Vec<u8> {
    chunks.concat()
}

/// Text long enough to take the streaming path
pub fn long_text() -> String {
    "Our traction has grown steadily this year, with usage doubling every quarter \
     and retention holding above ninety percent across every cohort we track. \
     That is the short version; happy to go deeper."
        .to_string()
}

// ---------------------------------------------------------------------------
// Capture primitive
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureState {
    supported: bool,
    deny: bool,
    runs: VecDeque<Vec<CaptureEvent>>,
    current: VecDeque<CaptureEvent>,
    running: bool,
    starts: usize,
    stops: usize,
    probe: Option<Box<dyn Fn() -> bool>>,
    probed: Vec<bool>,
}

/// Scripted capture primitive; each `start` consumes the next scripted run
#[derive(Clone)]
pub struct MockCapture {
    state: Rc<RefCell<CaptureState>>,
    notify: Rc<Notify>,
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCapture {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(CaptureState {
                supported: true,
                ..CaptureState::default()
            })),
            notify: Rc::new(Notify::new()),
        }
    }

    pub fn unsupported() -> Self {
        let capture = Self::new();
        capture.state.borrow_mut().supported = false;
        capture
    }

    pub fn denied() -> Self {
        let capture = Self::new();
        capture.state.borrow_mut().deny = true;
        capture
    }

    /// Script the events of the next run
    pub fn script_run(&self, events: Vec<CaptureEvent>) {
        self.state.borrow_mut().runs.push_back(events);
    }

    /// Raise an event in the current run
    pub fn push(&self, event: CaptureEvent) {
        self.state.borrow_mut().current.push_back(event);
        self.notify.notify_one();
    }

    pub fn starts(&self) -> usize {
        self.state.borrow().starts
    }

    pub fn stops(&self) -> usize {
        self.state.borrow().stops
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Evaluate `probe` on every `start`
    pub fn set_probe(&self, probe: impl Fn() -> bool + 'static) {
        self.state.borrow_mut().probe = Some(Box::new(probe));
    }

    pub fn probed(&self) -> Vec<bool> {
        self.state.borrow().probed.clone()
    }
}

#[async_trait(?Send)]
impl CapturePrimitive for MockCapture {
    fn is_supported(&self) -> bool {
        self.state.borrow().supported
    }

    fn start(&mut self) -> std::result::Result<(), CaptureFault> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.deny {
            return Err(CaptureFault::PermissionDenied);
        }
        state.starts += 1;
        if let Some(probe) = &state.probe {
            let value = probe();
            state.probed.push(value);
        }
        state.running = true;
        state.current = state.runs.pop_front().unwrap_or_default().into();
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.stops += 1;
        state.running = false;
        state.current.clear();
    }

    async fn next_event(&mut self) -> Option<CaptureEvent> {
        loop {
            if let Some(event) = self.state.borrow_mut().current.pop_front() {
                return Some(event);
            }
            let notify = Rc::clone(&self.notify);
            notify.notified().await;
        }
    }
}

/// A final result event
pub fn final_result(utterance: u64, text: &str) -> CaptureEvent {
    CaptureEvent::Result {
        utterance,
        transcript: text.to_string(),
        is_final: true,
    }
}

/// An interim result event
pub fn interim_result(utterance: u64, text: &str) -> CaptureEvent {
    CaptureEvent::Result {
        utterance,
        transcript: text.to_string(),
        is_final: false,
    }
}

// ---------------------------------------------------------------------------
// Completion relay
// ---------------------------------------------------------------------------

/// Relay that answers from a fixed list and records what it was sent
#[derive(Debug, Default)]
pub struct CannedRelay {
    replies: Mutex<VecDeque<String>>,
    failure: Option<String>,
    delay: Option<Duration>,
    histories: Mutex<Vec<Vec<StoredMessage>>>,
}

impl CannedRelay {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Delay every reply
    #[must_use]
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Histories received, one per request
    pub fn histories(&self) -> Vec<Vec<StoredMessage>> {
        self.histories.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionRelay for CannedRelay {
    async fn reply(&self, history: &[StoredMessage]) -> voxloop::Result<String> {
        self.histories.lock().unwrap().push(history.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = &self.failure {
            return Err(Error::Relay(failure.clone()));
        }
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Okay.".to_string()))
    }
}
