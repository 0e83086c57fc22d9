//! Playback engine integration tests
//!
//! Drive the engine against a scripted sink and synthesis endpoint, without
//! audio hardware or network.

use std::sync::Arc;
use std::time::Duration;

use voxloop::config::PlaybackConfig;
use voxloop::voice::decode::samples_to_wav;
use voxloop::voice::{PlaybackEngine, SessionId, SessionState, SinkEventKind, Strategy};
use voxloop::Error;

mod common;
use common::{
    MockReply, MockSink, MockSynthesizer, SinkBehavior, SinkCall, chunks, joined, long_text,
};

fn config() -> PlaybackConfig {
    PlaybackConfig {
        enabled: true,
        short_text_chars: 40,
        stream_open_timeout: Duration::from_millis(50),
    }
}

fn engine_with(behavior: SinkBehavior, synth: &Arc<MockSynthesizer>) -> (PlaybackEngine, MockSink) {
    let sink = MockSink::new(behavior);
    let engine = PlaybackEngine::new(sink.clone(), synth.clone(), config());
    (engine, sink)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_long_text_plays_after_first_chunk() {
    let body = chunks(4, 64);
    let synth = Arc::new(MockSynthesizer::audio(body.clone()));
    let (engine, sink) = engine_with(SinkBehavior::default(), &synth);

    let report = engine.speak(&long_text(), None).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::ChunkedStream));
    assert_eq!(report.attempted, vec![Strategy::ChunkedStream]);
    assert_eq!(report.state, SessionState::Ended);
    assert_eq!(report.bytes_received, 256);
    assert_eq!(synth.requests(), 1);

    // Output starts right after the first append, not after the download
    let calls = sink.calls();
    let play = calls.iter().position(|c| *c == SinkCall::Play).unwrap();
    let appends: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, SinkCall::Append(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(appends.len(), 4);
    assert!(appends[0] < play && play < appends[1]);

    let played = sink.played();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].1, joined(&body));
    assert!(!engine.is_speaking());
}

#[tokio::test]
async fn test_short_text_uses_direct_blob() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(2, 32)));
    let (engine, sink) = engine_with(SinkBehavior::default(), &synth);

    let report = engine.speak("Hi", None).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::DirectBlob));
    assert_eq!(report.attempted, vec![Strategy::DirectBlob]);
    assert_eq!(sink.count(|c| matches!(c, SinkCall::OpenStream(_))), 0);
    assert_eq!(synth.texts(), vec!["Hi.".to_string()]);
}

#[tokio::test]
async fn test_missing_append_facility_uses_direct_blob() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(3, 32)));
    let behavior = SinkBehavior {
        streaming: false,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let report = engine.speak(&long_text(), None).await.unwrap();

    assert_eq!(report.attempted, vec![Strategy::DirectBlob]);
    assert_eq!(sink.count(|c| matches!(c, SinkCall::OpenStream(_))), 0);
}

#[tokio::test]
async fn test_first_append_fault_falls_back_without_refetch() {
    let body = chunks(5, 50);
    let synth = Arc::new(MockSynthesizer::audio(body.clone()));
    let behavior = SinkBehavior {
        fail_append_at: Some(0),
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let report = engine.speak(&long_text(), None).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::DirectBlob));
    assert_eq!(
        report.attempted,
        vec![Strategy::ChunkedStream, Strategy::DirectBlob]
    );
    assert_eq!(synth.requests(), 1);

    let played = sink.played();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].1, joined(&body));
}

#[tokio::test]
async fn test_mid_stream_fault_replays_prefix_and_remainder() {
    let body = chunks(6, 10);
    let synth = Arc::new(MockSynthesizer::audio(body.clone()));
    let behavior = SinkBehavior {
        fail_append_at: Some(2),
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let report = engine.speak(&long_text(), None).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::DirectBlob));
    assert_eq!(synth.requests(), 1);
    assert_eq!(sink.played()[0].1, joined(&body));

    // The streaming fault is recovered, never returned
    assert_eq!(report.recovered.len(), 1);
    assert!(report.recovered[0].starts_with("streaming buffer fault"));
}

#[tokio::test]
async fn test_stream_open_timeout_falls_back() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(3, 16)));
    let behavior = SinkBehavior {
        open_hangs: true,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let report = tokio::time::timeout(Duration::from_secs(5), engine.speak(&long_text(), None))
        .await
        .expect("open timeout must bound the wait")
        .unwrap();

    assert_eq!(
        report.attempted,
        vec![Strategy::ChunkedStream, Strategy::DirectBlob]
    );
    assert_eq!(sink.count(|c| matches!(c, SinkCall::Append(_))), 0);
    assert_eq!(synth.requests(), 1);
}

#[tokio::test]
async fn test_clip_fault_falls_back_to_decode_buffer() {
    let wav = samples_to_wav(&[0.1; 1600], 16000).unwrap();
    let synth = Arc::new(MockSynthesizer::audio(vec![wav]).with_mime("audio/wav"));
    let behavior = SinkBehavior {
        reject_clip: true,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let report = engine.speak("Hello there", None).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::DecodeBuffer));
    assert_eq!(
        report.attempted,
        vec![Strategy::DirectBlob, Strategy::DecodeBuffer]
    );
    assert_eq!(sink.count(|c| matches!(c, SinkCall::LoadDecoded(_))), 1);
    assert_eq!(synth.requests(), 1);
    assert_eq!(report.recovered.len(), 1);
    assert!(report.recovered[0].starts_with("audio error"));
}

#[tokio::test]
async fn test_exhausted_strategies_error_and_release_once() {
    let synth = Arc::new(MockSynthesizer::audio(vec![vec![0x00, 0x01, 0x02, 0x03]]));
    let behavior = SinkBehavior {
        reject_clip: true,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let error = engine.speak("Hello there", None).await.unwrap_err();

    assert!(matches!(error, Error::Audio(_)));
    assert_eq!(sink.released(), vec![SessionId(1)]);
    assert_eq!(engine.history()[0].state, SessionState::Errored);
    assert!(!engine.is_speaking());
}

#[tokio::test]
async fn test_quota_is_distinct_from_unavailable() {
    let synth = Arc::new(MockSynthesizer::with_fallback(MockReply::Failure(
        500,
        r#"{"error":"internal"}"#.to_string(),
    )));
    synth.push(MockReply::Failure(
        429,
        r#"{"error":"quota_exceeded","message":"You have used all of your character quota"}"#
            .to_string(),
    ));
    let (engine, sink) = engine_with(SinkBehavior::default(), &synth);

    let quota = engine.speak(&long_text(), None).await.unwrap_err();
    assert!(matches!(quota, Error::QuotaExceeded(_)));
    assert!(quota.to_string().contains("voice budget exhausted"));

    let unavailable = engine.speak(&long_text(), None).await.unwrap_err();
    assert!(matches!(unavailable, Error::SynthesisUnavailable(_)));

    assert_eq!(sink.count(|c| *c == SinkCall::Play), 0);
    assert_eq!(sink.released().len(), 2);
}

#[tokio::test]
async fn test_truncated_body_is_fatal() {
    let synth = Arc::new(MockSynthesizer::with_fallback(MockReply::Truncated(chunks(2, 8))));
    let (engine, sink) = engine_with(SinkBehavior::default(), &synth);

    let error = engine.speak(&long_text(), None).await.unwrap_err();

    assert!(matches!(error, Error::SynthesisUnavailable(_)));
    assert_eq!(synth.requests(), 1);
    assert_eq!(sink.released().len(), 1);
}

#[tokio::test]
async fn test_supersede_releases_previous_exactly_once() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(3, 16)));
    let behavior = SinkBehavior {
        auto_end: false,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    let text = long_text();
    let first = engine.speak(&text, None);
    let second = async {
        wait_until(|| engine.is_speaking()).await;
        engine.speak("Second reply", None).await
    };
    let finisher = async {
        wait_until(|| sink.count(|c| *c == SinkCall::Play) == 2 && engine.is_speaking()).await;

        // A straggling signal from the superseded session is a no-op
        sink.raise(SessionId(1), SinkEventKind::Ended);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(engine.is_speaking());

        sink.finish();
    };

    let (first, second, ()) = tokio::join!(first, second, finisher);
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.state, SessionState::Superseded);
    assert_eq!(second.state, SessionState::Ended);
    assert_eq!(second.strategy, Some(Strategy::DirectBlob));
    assert_eq!(sink.released(), vec![SessionId(1), SessionId(2)]);

    // The old session was released before the new one touched the sink
    let calls = sink.calls();
    let released_first = calls
        .iter()
        .position(|c| *c == SinkCall::Release(SessionId(1)))
        .unwrap();
    let loaded_second = calls
        .iter()
        .position(|c| *c == SinkCall::LoadClip(SessionId(2)))
        .unwrap();
    assert!(released_first < loaded_second);

    let states: Vec<SessionState> = engine.history().iter().map(|s| s.state).collect();
    assert_eq!(states, vec![SessionState::Superseded, SessionState::Ended]);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(3, 16)));
    let behavior = SinkBehavior {
        auto_end: false,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);

    // Nothing playing
    engine.stop().await;
    engine.stop().await;
    assert!(!engine.is_speaking());

    let text = long_text();
    let speak = engine.speak(&text, None);
    let stopper = async {
        wait_until(|| engine.is_speaking()).await;
        engine.stop().await;
        engine.stop().await;
    };
    let (report, ()) = tokio::join!(speak, stopper);

    let report = report.unwrap();
    assert_eq!(report.state, SessionState::Ended);
    assert!(!engine.is_speaking());
    assert_eq!(sink.released(), vec![SessionId(1)]);
    assert_eq!(engine.history()[0].state, SessionState::Ended);
}

#[tokio::test]
async fn test_blocked_session_resumes_without_refetch() {
    let body = chunks(4, 20);
    let synth = Arc::new(MockSynthesizer::audio(body.clone()));
    let behavior = SinkBehavior {
        autoplay_blocked: true,
        ..SinkBehavior::default()
    };
    let (engine, sink) = engine_with(behavior, &synth);
    let mut blocked = engine.autoplay().subscribe();

    let error = engine.speak(&long_text(), None).await.unwrap_err();
    assert!(matches!(error, Error::PlaybackBlocked));
    assert!(engine.autoplay().is_blocked());
    assert!(blocked.has_changed().unwrap());
    assert!(engine.has_queued());
    assert_eq!(engine.history()[0].state, SessionState::Queued);

    // A gesture that is still refused keeps the session queued
    let error = engine.unlock_with_gesture().await.unwrap_err();
    assert!(matches!(error, Error::PlaybackBlocked));
    assert!(engine.has_queued());

    sink.allow_autoplay();
    let report = engine.unlock_with_gesture().await.unwrap().unwrap();

    assert_eq!(report.state, SessionState::Ended);
    assert_eq!(report.strategy, Some(Strategy::DirectBlob));
    assert!(!engine.autoplay().is_blocked());
    assert!(!engine.has_queued());
    assert_eq!(synth.requests(), 1);

    let played = sink.played();
    let last = played.last().unwrap();
    assert_eq!(last.1, joined(&body));
}

#[tokio::test]
async fn test_stop_discards_queued_session() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(2, 20)));
    let behavior = SinkBehavior {
        autoplay_blocked: true,
        ..SinkBehavior::default()
    };
    let (engine, _sink) = engine_with(behavior, &synth);

    let _ = engine.speak(&long_text(), None).await;
    assert!(engine.has_queued());

    engine.stop().await;
    assert!(!engine.has_queued());
}

#[tokio::test]
async fn test_disabled_output_skips_synthesis() {
    let synth = Arc::new(MockSynthesizer::audio(chunks(2, 20)));
    let sink = MockSink::new(SinkBehavior::default());
    let engine = PlaybackEngine::new(
        sink.clone(),
        synth.clone(),
        PlaybackConfig {
            enabled: false,
            ..config()
        },
    );

    let report = engine.speak(&long_text(), None).await.unwrap();

    assert_eq!(report.session, None);
    assert_eq!(synth.requests(), 0);
    assert!(sink.calls().is_empty());
}
