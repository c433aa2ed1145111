//! Session lifecycle tests against mocked backend and realtime
//! endpoints.
//!
//! The SDP endpoint is answered by a second str0m instance, so the
//! handshake is real; no remote peer ever drives the data channel, so
//! fully "successful" starts settle in audio-only mode after the open
//! timeout. That is exactly the degraded path the subsystem promises to
//! survive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::json;
use str0m::change::SdpOffer;
use str0m::{Candidate, Rtc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

use sori_realtime::{
    EventBus, ResilienceConfig, SessionManager, StartSessionRequest, TimingConfig, Topic,
    VoiceConfig,
};

/// Answer each SDP offer with a matching answer from a throwaway peer.
struct SdpResponder;

impl Respond for SdpResponder {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let offer_sdp = String::from_utf8(request.body.clone()).expect("offer is UTF-8");
        let mut peer = Rtc::new(Instant::now());
        peer.add_local_candidate(
            Candidate::host("127.0.0.1:9".parse().unwrap(), "udp").expect("host candidate"),
        );
        let offer = SdpOffer::from_sdp_string(&offer_sdp).expect("parseable offer");
        let answer = peer.sdp_api().accept_offer(offer).expect("acceptable offer");
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/sdp")
            .set_body_string(answer.to_sdp_string())
    }
}

async fn mock_backend(token_status: u16) -> MockServer {
    let server = MockServer::start().await;
    let template = if token_status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "ephemeralKey": "ek_test" }
        }))
    } else {
        ResponseTemplate::new(token_status).set_body_string("backend unavailable")
    };
    Mock::given(method("POST"))
        .and(path("/openai/realtime/token"))
        .respond_with(template)
        .mount(&server)
        .await;
    server
}

async fn mock_realtime() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/")).respond_with(SdpResponder).mount(&server).await;
    server
}

fn test_config(api_base: &str, realtime_base: &str) -> VoiceConfig {
    VoiceConfig::builder()
        .api_base(api_base)
        .realtime_base(realtime_base)
        .timing(TimingConfig {
            connection_cooldown: Duration::ZERO,
            data_channel_open_timeout: Duration::from_millis(300),
            response_create_delay: Duration::from_millis(50),
            ..TimingConfig::default()
        })
        .resilience(ResilienceConfig {
            debounce_min_interval: Duration::from_millis(2000),
            user_intent_window: Duration::from_millis(200),
            ..ResilienceConfig::default()
        })
        .build()
}

fn recording_manager(config: VoiceConfig) -> (SessionManager, Arc<Mutex<Vec<&'static str>>>) {
    let bus = EventBus::new();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for topic in [
        Topic::Initialized,
        Topic::Connecting,
        Topic::Connected,
        Topic::AudioOnlyMode,
        Topic::SessionStarted,
        Topic::SessionStopped,
        Topic::UserEndedSession,
        Topic::Error,
    ] {
        let log = Arc::clone(&log);
        bus.on(topic, move |event| log.lock().push(event.topic().as_str()));
    }

    let manager = SessionManager::builder(config, SecretString::from("access"))
        .bus(bus)
        .build();
    (manager, log)
}

fn count(log: &Mutex<Vec<&'static str>>, topic: &str) -> usize {
    log.lock().iter().filter(|t| **t == topic).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_reaches_active_in_audio_only_and_orders_emissions() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    let started = manager
        .start_session(StartSessionRequest::new("s2").user(json!({"id": "u1"})))
        .await
        .unwrap();
    assert!(started);

    let state = manager.state();
    assert!(state.is_session_active);
    assert!(state.audio_only, "no peer drives the channel, so the session degrades");
    assert!(state.session_id.as_deref().unwrap().starts_with("session_"));
    assert_eq!(state.scenario_id.as_deref(), Some("s2"));

    // connecting → audioOnlyMode → sessionStarted, in that order.
    let events = log.lock().clone();
    let connecting = events.iter().position(|t| *t == "connecting").unwrap();
    let audio_only = events.iter().position(|t| *t == "audioOnlyMode").unwrap();
    let started_at = events.iter().position(|t| *t == "sessionStarted").unwrap();
    assert!(connecting < audio_only && audio_only < started_at, "order was {events:?}");

    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rapid_duplicate_start_is_debounced_as_success() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());
    // Within the debounce window: resolves true with no second start.
    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());

    assert_eq!(count(&log, "sessionStarted"), 1);
    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_parallel_starts_produce_exactly_one_session() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    let handles: Vec<_> = ["s1", "s2", "s3"]
        .into_iter()
        .map(|scenario| {
            let manager = manager.clone();
            tokio::spawn(
                async move { manager.start_session(StartSessionRequest::new(scenario)).await },
            )
        })
        .collect();
    let results: Vec<_> =
        futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "results: {results:?}");
    assert_eq!(count(&log, "sessionStarted"), 1);

    let state = manager.state();
    assert!(state.is_session_active);
    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_end_blocks_auto_restart_within_window() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());
    manager.stop_session_by_user().await.unwrap();
    assert_eq!(count(&log, "userEndedSession"), 1);

    // Automatic restart inside the respect window is rejected.
    let err = manager
        .start_session(StartSessionRequest::new("s4").auto())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("recently ended by user"), "got: {err}");

    // A user-initiated start bypasses the latch immediately.
    assert!(manager.start_session(StartSessionRequest::new("s4")).await.unwrap());
    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_restart_allowed_after_window_elapses() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, _log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());
    manager.stop_session_by_user().await.unwrap();

    // The configured window is 200 ms; beyond it auto starts may run.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(
        manager.start_session(StartSessionRequest::new("s5").auto()).await.unwrap()
    );
    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_failures_open_the_circuit_breaker() {
    let backend = mock_backend(500).await;
    let realtime = mock_realtime().await;
    let mut config = test_config(&backend.uri(), &realtime.uri());
    config.resilience.debounce_min_interval = Duration::from_millis(1);
    let (manager, log) = recording_manager(config);
    manager.initialize().unwrap();

    for scenario in ["f1", "f2", "f3"] {
        let err = manager.start_session(StartSessionRequest::new(scenario)).await.unwrap_err();
        assert_eq!(err.kind(), "token", "bring-up fails at the token stage");
    }
    assert_eq!(count(&log, "error"), 3, "each admitted start surfaced a session_start error");

    let err = manager.start_session(StartSessionRequest::new("f4")).await.unwrap_err();
    assert_eq!(err.kind(), "circuit_open");
    assert!(err.to_string().contains("Try again in"), "got: {err}");

    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_session_is_idempotent_and_clears_transport() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    // Stopping while idle is a no-op success.
    manager.stop_session().await.unwrap();
    assert_eq!(count(&log, "sessionStopped"), 0);

    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());
    manager.stop_session().await.unwrap();

    let state = manager.state();
    assert!(!state.is_session_active);
    assert!(!state.is_connected);
    assert!(state.session_id.is_none(), "transport references are cleared on stop");
    assert_eq!(count(&log, "sessionStopped"), 1);

    manager.stop_session().await.unwrap();
    assert_eq!(count(&log, "sessionStopped"), 1, "second stop is a no-op");

    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_then_initialize_returns_to_clean_state() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, _log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));
    manager.initialize().unwrap();

    assert!(manager.start_session(StartSessionRequest::new("s2")).await.unwrap());
    manager.destroy().await;

    let state = manager.state();
    assert!(!state.is_session_active);
    assert!(state.session_id.is_none());
    assert!(!state.user_ended_session);

    // Re-initialize brings the manager back to a fresh-construction
    // equivalent: starts are accepted again.
    manager.initialize().unwrap();
    assert!(manager.start_session(StartSessionRequest::new("s6")).await.unwrap());
    manager.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialize_is_idempotent() {
    let backend = mock_backend(200).await;
    let realtime = mock_realtime().await;
    let (manager, log) = recording_manager(test_config(&backend.uri(), &realtime.uri()));

    manager.initialize().unwrap();
    manager.initialize().unwrap();
    assert_eq!(count(&log, "initialized"), 2, "re-initialize is safe and re-announces");

    manager.destroy().await;
}
