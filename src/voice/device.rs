//! Output sink backed by the default audio device

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use crate::voice::decode::{self, StreamDecoder, resample_linear};
use crate::voice::sink::{
    AudioClip, DecodedAudio, OutputSink, PlayRejection, SessionId, SinkEvent, SinkEventKind,
    SinkEvents, SinkFault,
};
use crate::Error;

/// Sample rate for playback (matches common TTS output)
const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Samples waiting to be played
#[derive(Debug, Default)]
struct PcmQueue {
    samples: VecDeque<f32>,
    source_done: bool,
}

type SharedQueue = Arc<Mutex<PcmQueue>>;

/// Plays audio to the default output device
pub struct DeviceSink {
    config: StreamConfig,
    events: Option<SinkEvents>,
    session: Option<SessionId>,
    queue: SharedQueue,
    stream: Option<Stream>,
    feeder: Option<mpsc::Sender<Vec<u8>>>,
}

impl DeviceSink {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device with a usable configuration exists
    pub fn new() -> crate::Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| c.channels() == 2 && supports_rate(c))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = OUTPUT_SAMPLE_RATE,
            channels = config.channels,
            "audio output initialized"
        );

        Ok(Self {
            config,
            events: None,
            session: None,
            queue: SharedQueue::default(),
            stream: None,
            feeder: None,
        })
    }

    /// Swap in an empty queue owned by `session`
    fn fresh_queue(&mut self, session: SessionId) -> SharedQueue {
        self.stream = None;
        self.feeder = None;
        self.queue = SharedQueue::default();
        self.session = Some(session);
        Arc::clone(&self.queue)
    }

    fn emit(&self, kind: SinkEventKind) {
        if let (Some(events), Some(session)) = (&self.events, self.session) {
            let _ = events.send(SinkEvent::new(session, kind));
        }
    }
}

#[async_trait(?Send)]
impl OutputSink for DeviceSink {
    fn attach(&mut self, events: SinkEvents) {
        self.events = Some(events);
    }

    fn supports_streaming(&self, mime: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        mime.starts_with("audio/mpeg") || mime.starts_with("audio/mp3")
    }

    async fn load_clip(&mut self, session: SessionId, clip: &AudioClip) -> Result<(), SinkFault> {
        let audio = decode::decode_clip(clip).map_err(|e| SinkFault::new(e.to_string()))?;
        self.load_decoded(session, audio).await
    }

    async fn load_decoded(
        &mut self,
        session: SessionId,
        audio: DecodedAudio,
    ) -> Result<(), SinkFault> {
        if audio.sample_rate == 0 {
            return Err(SinkFault::new("audio has no sample rate"));
        }

        let samples = resample_linear(&audio.samples, audio.sample_rate, OUTPUT_SAMPLE_RATE);
        let queue = self.fresh_queue(session);
        let mut queue = queue
            .lock()
            .map_err(|_| SinkFault::new("playback queue poisoned"))?;
        queue.samples.extend(samples);
        queue.source_done = true;
        drop(queue);
        Ok(())
    }

    async fn open_stream(&mut self, session: SessionId, mime: &str) -> Result<(), SinkFault> {
        if !self.supports_streaming(mime) {
            return Err(SinkFault::new(format!("cannot stream {mime}")));
        }

        let queue = self.fresh_queue(session);
        let (feeder, chunks) = mpsc::channel(1);
        let events = self.events.clone();

        std::thread::Builder::new()
            .name("voxloop-stream-decoder".to_string())
            .spawn(move || decode_stream(chunks, &queue, events.as_ref(), session))
            .map_err(|e| SinkFault::new(e.to_string()))?;

        self.feeder = Some(feeder);
        tracing::trace!(session = %session, "streaming buffer open");
        Ok(())
    }

    async fn append(&mut self, chunk: &[u8]) -> Result<(), SinkFault> {
        let feeder = self
            .feeder
            .as_ref()
            .ok_or_else(|| SinkFault::new("no streaming buffer open"))?;
        feeder
            .send(chunk.to_vec())
            .await
            .map_err(|_| SinkFault::new("streaming decoder stopped"))
    }

    fn end_stream(&mut self) {
        self.feeder = None;
    }

    async fn play(&mut self) -> Result<(), PlayRejection> {
        let Some(session) = self.session else {
            return Err(PlayRejection::Failed("nothing loaded".to_string()));
        };

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayRejection::Failed("no output device".to_string()))?;

        let channels = usize::from(self.config.channels.max(1));
        let queue = Arc::clone(&self.queue);
        let ended_events = self.events.clone();
        let error_events = self.events.clone();
        let mut ended = false;

        let stream = device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut queue) = queue.lock() else {
                        data.fill(0.0);
                        return;
                    };

                    for frame in data.chunks_mut(channels) {
                        let sample = queue.samples.pop_front().unwrap_or(0.0);
                        frame.fill(sample);
                    }

                    if !ended && queue.source_done && queue.samples.is_empty() {
                        ended = true;
                        if let Some(events) = &ended_events {
                            let _ = events.send(SinkEvent::new(session, SinkEventKind::Ended));
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    if let Some(events) = &error_events {
                        let _ = events
                            .send(SinkEvent::new(session, SinkEventKind::Failed(err.to_string())));
                    }
                },
                None,
            )
            .map_err(|e| PlayRejection::Failed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| PlayRejection::Failed(e.to_string()))?;
        self.stream = Some(stream);
        self.emit(SinkEventKind::Started);
        Ok(())
    }

    fn stop(&mut self) {
        self.stream = None;
        self.feeder = None;
        if let Ok(mut queue) = self.queue.lock() {
            queue.samples.clear();
        }
    }

    fn release(&mut self, session: SessionId) {
        if self.session == Some(session) {
            self.session = None;
            self.queue = SharedQueue::default();
        }
    }
}

/// Blocking reader over appended chunks; EOF once the feeder is dropped
struct ChunkReader {
    chunks: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.chunks.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Decoder thread body for the streaming buffer
fn decode_stream(
    chunks: mpsc::Receiver<Vec<u8>>,
    queue: &SharedQueue,
    events: Option<&SinkEvents>,
    session: SessionId,
) {
    let mut decoder = StreamDecoder::new(ChunkReader {
        chunks,
        current: Vec::new(),
        pos: 0,
    });
    let mut frames = 0usize;

    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                frames += 1;
                let samples = resample_linear(&frame.samples, frame.sample_rate, OUTPUT_SAMPLE_RATE);
                if let Ok(mut queue) = queue.lock() {
                    queue.samples.extend(samples);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(session = %session, error = %e, "stream decode failed");
                if let Some(events) = events {
                    let _ = events.send(SinkEvent::new(session, SinkEventKind::Failed(e.to_string())));
                }
                return;
            }
        }
    }

    if let Ok(mut queue) = queue.lock() {
        queue.source_done = true;
    }
    tracing::trace!(session = %session, frames, "stream decode finished");
}
