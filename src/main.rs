use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use voxloop::conversation::{
    ConversationEvent, Coordinator, CoordinatorHandle, HttpCompletionRelay, InMemoryMessageStore,
};
use voxloop::recognition::{CaptureEvent, CapturePrimitive, MicrophoneCapture};
use voxloop::voice::{
    DecodedAudio, DeviceSink, HttpSynthesizer, OutputSink, PlaybackEngine, SessionId,
    SinkEventKind,
};
use voxloop::{Config, Error};

/// voxloop - hands-free voice conversation client
#[derive(Parser)]
#[command(name = "voxloop", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Start with conversation mode on
    #[arg(long)]
    conversation: bool,

    /// Disable voice output (replies are printed only)
    #[arg(long, env = "VOXLOOP_MUTE")]
    mute: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Speak one line of text and print the playback report
    Say {
        /// Text to speak
        text: String,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test microphone capture and transcription
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,voxloop=info",
        1 => "info,voxloop=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if cli.mute {
        config.playback.enabled = false;
    }
    if cli.conversation {
        config.conversation_mode = true;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Say { text }) => say(config, &text).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::TestMic { duration }) => test_mic(&config, duration).await,
        None => converse(config).await,
    }
}

/// Hands-free loop driven from stdin
#[allow(clippy::future_not_send)]
async fn converse(config: Config) -> anyhow::Result<()> {
    let voice_id = config.synthesis.voice_id.clone();
    let engine = PlaybackEngine::new(
        DeviceSink::new()?,
        Arc::new(HttpSynthesizer::new(config.synthesis)?),
        config.playback,
    );
    let capture = MicrophoneCapture::new(&config.recognition);
    let relay = Arc::new(HttpCompletionRelay::new(config.relay_url));

    let (coordinator, handle) = Coordinator::new(
        engine,
        capture,
        relay,
        Arc::new(InMemoryMessageStore::new()),
        voice_id,
        config.conversation_mode,
    );
    let events = handle.subscribe();

    println!("voxloop ready. Type to chat; /mode, /mic, /gesture, /stop, /quit");

    let (result, (), ()) = tokio::join!(
        coordinator.run(),
        read_commands(handle),
        print_events(events)
    );
    result?;
    Ok(())
}

/// Translate stdin lines into coordinator commands
async fn read_commands(handle: CoordinatorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };

        match line.trim() {
            "" => {}
            "/mode" => handle.set_conversation_mode(!handle.is_conversation_mode()),
            "/mic" => handle.toggle_mic(),
            "/gesture" => handle.user_gesture(),
            "/stop" => handle.stop_speaking(),
            "/quit" => break,
            text => {
                // Typing counts as a gesture for autoplay purposes
                handle.user_gesture();
                handle.submit(text);
            }
        }
    }

    handle.shutdown();
}

async fn print_events(mut events: broadcast::Receiver<ConversationEvent>) {
    loop {
        match events.recv().await {
            Ok(ConversationEvent::StateChanged(state)) => println!("[{state}]"),
            Ok(ConversationEvent::Transcript(text)) => println!("you: {text}"),
            Ok(ConversationEvent::Reply(text)) => println!("assistant: {text}"),
            Ok(ConversationEvent::Playback(report)) => {
                tracing::debug!(?report, "playback report");
            }
            Ok(ConversationEvent::Blocked) => {
                println!("(playback blocked, type /gesture to hear the reply)");
            }
            Ok(ConversationEvent::VoiceDisabled(reason)) => {
                println!("(voice output off: {reason})");
            }
            Ok(ConversationEvent::Error(message)) => println!("error: {message}"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Speak one line through the full playback engine
#[allow(clippy::future_not_send)]
async fn say(config: Config, text: &str) -> anyhow::Result<()> {
    let voice_id = config.synthesis.voice_id.clone();
    let engine = PlaybackEngine::new(
        DeviceSink::new()?,
        Arc::new(HttpSynthesizer::new(config.synthesis)?),
        config.playback,
    );

    let report = engine.speak(text, voice_id.as_deref()).await?;

    println!("session:   {}", report.session.map_or_else(|| "-".to_string(), |s| s.to_string()));
    println!("strategy:  {}", report.strategy.map_or("-", |s| s.as_str()));
    println!(
        "attempted: {}",
        report
            .attempted
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!("bytes:     {}", report.bytes_received);
    println!("state:     {:?}", report.state);

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut sink = DeviceSink::new()?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    sink.attach(events_tx);

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let session = SessionId(1);
    sink.load_decoded(session, DecodedAudio { sample_rate, samples })
        .await
        .map_err(|e| anyhow::anyhow!("load failed: {e}"))?;
    sink.play()
        .await
        .map_err(|e| anyhow::anyhow!("play failed: {e}"))?;

    let wait = async {
        while let Some(event) = events.recv().await {
            match event.kind {
                SinkEventKind::Started => println!("Playing..."),
                SinkEventKind::Ended => return Ok(()),
                SinkEventKind::Failed(reason) => return Err(anyhow::anyhow!(reason)),
            }
        }
        Ok(())
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .map_err(|_| anyhow::anyhow!("playback did not finish"))??;

    sink.stop();
    sink.release(session);

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test microphone capture by printing raw capture events
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Say something and pause!\n");

    let mut capture = MicrophoneCapture::new(&config.recognition);
    if !capture.is_supported() {
        anyhow::bail!("no input device available");
    }
    capture.start().map_err(Error::from)?;

    let listen = async {
        while let Some(event) = capture.next_event().await {
            match event {
                CaptureEvent::Started => println!("capture started"),
                CaptureEvent::Result { utterance, transcript, .. } => {
                    println!("[{utterance}] {transcript}");
                }
                CaptureEvent::Error(kind) => println!("capture error: {kind}"),
                CaptureEvent::Ended => {
                    println!("capture ended");
                    break;
                }
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(duration), listen).await;
    capture.stop();

    println!("\n---");
    println!("If your words were printed, capture and transcription work!");
    println!("If nothing was heard, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Is OPENAI_API_KEY (or VOXLOOP_STT_URL) set?");

    Ok(())
}
